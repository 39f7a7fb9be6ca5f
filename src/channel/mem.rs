//! In-process transport backed by a tokio runtime.
//!
//! Services are plain functions. Each call runs as a task on the channel's
//! own multi-thread runtime, so reactor callbacks arrive on worker threads
//! exactly as they would from a network transport. A configurable latency is
//! applied before every response and every stream item.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;

use super::{CallContext, ReadStream, StreamChannel, UnaryChannel};
use crate::call::{StreamReactor, UnaryReactor};
use crate::config::TransportConfig;
use crate::error::BridgeResult;
use crate::status::Status;

const LOG_TARGET: &str = "rpc_reactor::transport";

type UnaryService<Req, Resp> = dyn Fn(Req) -> Result<Resp, Status> + Send + Sync;
type StreamService<Req, Resp> = dyn Fn(Req) -> Result<Vec<Resp>, Status> + Send + Sync;

/// Owner of the transport runtime. Channels created from it stay usable only
/// while it is alive; dropping it aborts every in-flight call.
pub struct MemChannel {
    runtime: Runtime,
    latency: Duration,
}

impl MemChannel {
    /// Build the transport runtime. Must not be called from async context.
    pub fn new(config: &TransportConfig) -> BridgeResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()?;
        log::debug!(
            target: LOG_TARGET,
            "Transport runtime started with {} worker(s)",
            config.worker_threads
        );
        Ok(Self {
            runtime,
            latency: config.latency(),
        })
    }

    /// Expose `service` as a unary method.
    pub fn unary<Req, Resp, F>(&self, service: F) -> MemUnary<Req, Resp>
    where
        F: Fn(Req) -> Result<Resp, Status> + Send + Sync + 'static,
    {
        MemUnary {
            handle: self.runtime.handle().clone(),
            service: Arc::new(service),
            latency: self.latency,
        }
    }

    /// Expose `service` as a server-streaming method. The returned items are
    /// delivered one per read request.
    pub fn stream<Req, Resp, F>(&self, service: F) -> MemStream<Req, Resp>
    where
        F: Fn(Req) -> Result<Vec<Resp>, Status> + Send + Sync + 'static,
    {
        MemStream {
            handle: self.runtime.handle().clone(),
            service: Arc::new(service),
            latency: self.latency,
        }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }
}

/// Unary method of a [`MemChannel`].
pub struct MemUnary<Req, Resp> {
    handle: Handle,
    service: Arc<UnaryService<Req, Resp>>,
    latency: Duration,
}

impl<Req, Resp> MemUnary<Req, Resp> {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl<Req, Resp> Clone for MemUnary<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            service: Arc::clone(&self.service),
            latency: self.latency,
        }
    }
}

impl<Req, Resp> UnaryChannel<Req, Resp> for MemUnary<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn start_unary(&self, ctx: CallContext, request: Req, reactor: Arc<UnaryReactor<Resp>>) {
        let service = Arc::clone(&self.service);
        let latency = self.latency;
        self.handle.spawn(async move {
            let outcome = guarded(&ctx, async {
                pause(latency).await;
                service(request)
            })
            .await
            .and_then(|result| result);

            if let Err(status) = &outcome {
                log::debug!(
                    target: LOG_TARGET,
                    "Call {} finished with {}",
                    ctx.call_id(),
                    status
                );
            }
            reactor.on_done(outcome);
        });
    }
}

/// Server-streaming method of a [`MemChannel`].
pub struct MemStream<Req, Resp> {
    handle: Handle,
    service: Arc<StreamService<Req, Resp>>,
    latency: Duration,
}

impl<Req, Resp> MemStream<Req, Resp> {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl<Req, Resp> Clone for MemStream<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            service: Arc::clone(&self.service),
            latency: self.latency,
        }
    }
}

impl<Req, Resp> StreamChannel<Req, Resp> for MemStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn start_stream(
        &self,
        ctx: CallContext,
        request: Req,
        reactor: Arc<StreamReactor<Resp>>,
    ) -> Arc<dyn ReadStream> {
        let (tx, reads) = mpsc::unbounded_channel();
        let service = Arc::clone(&self.service);
        let latency = self.latency;
        // The reactor owns the read stream, so the task must not keep the
        // reactor alive while it waits for reads.
        let reactor = Arc::downgrade(&reactor);
        self.handle.spawn(async move {
            let status = drive_stream(&ctx, &reactor, service, request, latency, reads).await;
            match reactor.upgrade() {
                Some(reactor) => {
                    log::debug!(
                        target: LOG_TARGET,
                        "Stream {} finished with {}",
                        ctx.call_id(),
                        status
                    );
                    reactor.on_end(status);
                }
                None => log::debug!(
                    target: LOG_TARGET,
                    "Stream {} dropped by the application ({})",
                    ctx.call_id(),
                    status
                ),
            }
        });
        Arc::new(MemReadStream { tx })
    }
}

/// Read requests travel to the stream's task over a channel, so
/// `start_read` never runs reactor code on the caller's thread.
struct MemReadStream {
    tx: mpsc::UnboundedSender<()>,
}

impl ReadStream for MemReadStream {
    fn start_read(&self) {
        // The task is gone once the stream ended; late reads are ignored.
        let _ = self.tx.send(());
    }
}

/// Serve one read request per item. Returns the stream's final status.
async fn drive_stream<Req, Resp>(
    ctx: &CallContext,
    reactor: &Weak<StreamReactor<Resp>>,
    service: Arc<StreamService<Req, Resp>>,
    request: Req,
    latency: Duration,
    mut reads: mpsc::UnboundedReceiver<()>,
) -> Status
where
    Resp: Send + 'static,
{
    let mut items = match guarded(ctx, async { service(request) }).await {
        Ok(Ok(items)) => items.into_iter(),
        Ok(Err(status)) | Err(status) => return status,
    };

    loop {
        match guarded(ctx, reads.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return Status::cancelled("read stream released"),
            Err(status) => return status,
        }
        if let Err(status) = guarded(ctx, pause(latency)).await {
            return status;
        }
        let Some(live) = reactor.upgrade() else {
            return Status::cancelled("stream released");
        };
        match items.next() {
            Some(item) => live.on_item(item),
            None => {
                live.on_read_closed();
                return Status::ok();
            }
        }
    }
}

/// Run `future` unless the call is cancelled or its deadline passes first.
async fn guarded<F: Future>(ctx: &CallContext, future: F) -> Result<F::Output, Status> {
    let deadline = async {
        match ctx.deadline() {
            Some(deadline) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancellation().cancelled() => Err(Status::cancelled("call cancelled by client")),
        _ = deadline => Err(Status::deadline_exceeded("deadline exceeded")),
        output = future => Ok(output),
    }
}

async fn pause(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

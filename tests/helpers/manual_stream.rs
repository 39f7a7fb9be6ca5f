//! Stream transport driven by hand from the test thread.
//!
//! The channel records the reactor and every read request, and delivers
//! nothing on its own. Tests play the transport by calling `deliver`,
//! `close` and `end`, which makes read-request accounting deterministic.

use rpc_reactor::{CallContext, ReadStream, Status, StreamChannel, StreamReactor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct ReadCounter {
    reads: AtomicUsize,
}

impl ReadStream for ReadCounter {
    fn start_read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ManualStreamChannel<T> {
    reads: Arc<ReadCounter>,
    reactor: Mutex<Option<Arc<StreamReactor<T>>>>,
    context: Mutex<Option<CallContext>>,
}

impl<T: Send + 'static> ManualStreamChannel<T> {
    pub fn new() -> Self {
        Self {
            reads: Arc::new(ReadCounter::default()),
            reactor: Mutex::new(None),
            context: Mutex::new(None),
        }
    }

    /// Read requests received so far.
    pub fn reads(&self) -> usize {
        self.reads.reads.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> CallContext {
        self.context
            .lock()
            .unwrap()
            .clone()
            .expect("stream was not started")
    }

    fn reactor(&self) -> Arc<StreamReactor<T>> {
        self.reactor
            .lock()
            .unwrap()
            .clone()
            .expect("stream was not started")
    }

    /// Answer the outstanding read request with `item`.
    pub fn deliver(&self, item: T) {
        self.reactor().on_item(item);
    }

    /// Answer the outstanding read request with end-of-stream.
    pub fn close(&self) {
        self.reactor().on_read_closed();
    }

    pub fn end(&self, status: Status) {
        self.reactor().on_end(status);
    }
}

impl<T: Send + 'static> StreamChannel<(), T> for ManualStreamChannel<T> {
    fn start_stream(
        &self,
        ctx: CallContext,
        _request: (),
        reactor: Arc<StreamReactor<T>>,
    ) -> Arc<dyn ReadStream> {
        *self.reactor.lock().unwrap() = Some(reactor);
        *self.context.lock().unwrap() = Some(ctx);
        self.reads.clone()
    }
}

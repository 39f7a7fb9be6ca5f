//! Reactor for single-response calls.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::handle::CallHandle;
use super::{CallId, CallKind, Reactor};
use crate::channel::{CallContext, UnaryChannel};
use crate::error::{BridgeError, BridgeResult};
use crate::status::Status;

type DoneCallback<T> = Box<dyn Fn(&Arc<UnaryReactor<T>>) + Send + Sync>;

/// One in-flight unary call.
///
/// The done callback runs synchronously on the transport thread. It must not
/// block; its job is to re-dispatch onto the scheduler, typically with
/// `EventSender::enqueue_call`.
///
/// # Example
///
/// ```ignore
/// let sender = scheduler.sender();
/// let reactor = Arc::new(UnaryReactor::new(move |reactor| {
///     let _ = sender.enqueue_call("GetFeatureOnDone", reactor);
/// }));
/// reactor.start(&channel, point)?;
/// ```
pub struct UnaryReactor<T> {
    handle: CallHandle<T>,
    on_done: DoneCallback<T>,
    timeout: Option<Duration>,
    started: AtomicBool,
}

impl<T: Send + 'static> UnaryReactor<T> {
    pub fn new<F>(on_done: F) -> Self
    where
        F: Fn(&Arc<UnaryReactor<T>>) + Send + Sync + 'static,
    {
        Self {
            handle: CallHandle::new(),
            on_done: Box::new(on_done),
            timeout: None,
            started: AtomicBool::new(false),
        }
    }

    /// Ask the transport to give up after `timeout`, counted from `start`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Issue the call. Returns immediately; completion arrives as `on_done`.
    pub fn start<Req, C>(self: &Arc<Self>, channel: &C, request: Req) -> BridgeResult<()>
    where
        C: UnaryChannel<Req, T> + ?Sized,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyStarted {
                call_id: self.call_id(),
            });
        }

        let mut ctx = CallContext::new(self.call_id(), self.handle.cancellation().clone());
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }

        log::debug!(
            target: "rpc_reactor::call",
            "Starting unary call {}",
            self.call_id()
        );
        channel.start_unary(ctx, request, Arc::clone(self));
        Ok(())
    }

    /// Move the response out. `None` if the call failed, is still pending, or
    /// the response was already taken.
    pub fn take_response(&self) -> Option<T> {
        self.handle.take()
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.handle.is_cancel_requested()
    }

    /// Transport-facing completion. Must be called exactly once per call.
    pub fn on_done(self: &Arc<Self>, outcome: Result<T, Status>) {
        if self.handle.is_terminated() {
            debug_assert!(false, "on_done delivered twice for call {}", self.call_id());
            log::warn!(
                target: "rpc_reactor::call",
                "Ignoring repeated completion for call {}",
                self.call_id()
            );
            return;
        }

        match outcome {
            Ok(response) => {
                self.handle.set_status(Status::ok());
                self.handle.publish(response);
            }
            Err(status) => {
                log::debug!(
                    target: "rpc_reactor::call",
                    "Unary call {} failed: {}",
                    self.call_id(),
                    status
                );
                self.handle.set_status(status);
            }
        }
        self.handle.terminate();

        (self.on_done)(self);
    }
}

impl<T: Send + 'static> Reactor for UnaryReactor<T> {
    fn call_id(&self) -> CallId {
        self.handle.id()
    }

    fn kind(&self) -> CallKind {
        CallKind::Unary
    }

    fn try_cancel(&self) {
        self.handle.try_cancel();
    }

    fn status(&self) -> Option<Status> {
        self.handle.status()
    }

    fn is_terminated(&self) -> bool {
        self.handle.is_terminated()
    }
}

impl<T> fmt::Debug for UnaryReactor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryReactor")
            .field("call_id", &self.handle.id())
            .field("ready", &self.handle.is_ready())
            .field("terminated", &self.handle.is_terminated())
            .field("cancel_requested", &self.handle.is_cancel_requested())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallState;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Channel that records requests and leaves completion to the test.
    #[derive(Default)]
    struct RecordingChannel {
        started: Mutex<Vec<(CallContext, u32)>>,
    }

    impl UnaryChannel<u32, String> for RecordingChannel {
        fn start_unary(&self, ctx: CallContext, request: u32, _reactor: Arc<UnaryReactor<String>>) {
            self.started.lock().unwrap().push((ctx, request));
        }
    }

    fn counting_reactor() -> (Arc<UnaryReactor<String>>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let reactor = Arc::new(UnaryReactor::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        (reactor, fired)
    }

    #[test]
    fn successful_completion_exposes_response_once() {
        let (reactor, fired) = counting_reactor();
        assert_eq!(reactor.state(), CallState::Pending);

        reactor.on_done(Ok("id=7".to_string()));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.status(), Some(Status::ok()));
        assert_eq!(reactor.state(), CallState::Succeeded);
        assert!(reactor.is_terminated());
        assert_eq!(reactor.take_response().as_deref(), Some("id=7"));
        assert!(reactor.take_response().is_none());
    }

    #[test]
    fn failed_completion_has_no_response() {
        let (reactor, fired) = counting_reactor();
        reactor.on_done(Err(Status::unavailable("connection refused")));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!reactor.is_ready());
        assert!(reactor.take_response().is_none());
        assert!(matches!(reactor.state(), CallState::Failed(status) if !status.is_ok()));
    }

    #[test]
    fn start_hands_context_and_request_to_channel() {
        let (reactor, _) = counting_reactor();
        let channel = RecordingChannel::default();

        reactor.start(&channel, 42).unwrap();

        let started = channel.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0.call_id(), reactor.call_id());
        assert_eq!(started[0].1, 42);
        assert!(started[0].0.deadline().is_none());
    }

    #[test]
    fn start_twice_is_rejected() {
        let (reactor, _) = counting_reactor();
        let channel = RecordingChannel::default();

        reactor.start(&channel, 1).unwrap();
        let err = reactor.start(&channel, 2).unwrap_err();

        assert!(matches!(
            err,
            BridgeError::AlreadyStarted { call_id } if call_id == reactor.call_id()
        ));
        assert_eq!(channel.started.lock().unwrap().len(), 1);
    }

    #[test]
    fn timeout_becomes_context_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let reactor = Arc::new(
            UnaryReactor::<String>::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .with_timeout(Duration::from_secs(30)),
        );
        let channel = RecordingChannel::default();
        reactor.start(&channel, 1).unwrap();

        let started = channel.started.lock().unwrap();
        assert!(started[0].0.deadline().is_some());
    }

    #[test]
    fn cancel_reaches_the_transport_context() {
        let (reactor, _) = counting_reactor();
        let channel = RecordingChannel::default();
        reactor.start(&channel, 1).unwrap();

        reactor.try_cancel();
        reactor.try_cancel();

        let started = channel.started.lock().unwrap();
        assert!(started[0].0.is_cancelled());
        assert!(reactor.status().is_none(), "cancel only signals intent");
    }
}

//! Reactor for server-streaming calls with hold/resume flow control.
//!
//! # State machine
//!
//! ```text
//!            start                on_item -> Hold
//!   Idle ───────────► Reading ─────────────────────► ItemHeld
//!                      │  ▲                              │
//!                      │  └──────── take_response ───────┘
//!                      │            (fetch, then release)
//!                      │                                 │
//!                      └──── on_end ──► Ended ◄── on_end ┘
//! ```
//!
//! While an item is held, only the consumer may request the next one. The
//! held state owns a strong reference to the transport's read stream, so the
//! resume path can always issue its fetch against live transport state.
//! Every fetch is issued with the state lock held, and `on_end` marks the
//! call terminated under the same lock: once `on_end` has run, no further
//! read is requested.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::handle::CallHandle;
use super::{CallId, CallKind, Reactor};
use crate::channel::{CallContext, ReadStream, StreamChannel};
use crate::error::{BridgeError, BridgeResult, LockResultExt};
use crate::status::Status;

/// What the transport should do after delivering an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    /// The item was consumed inside the callback; fetch the next one now.
    Continue,
    /// Keep the item and pause until the application takes it.
    Hold,
}

type ItemCallback<T> = Box<dyn Fn(&Arc<StreamReactor<T>>, &T) -> ReadDecision + Send + Sync>;
type StreamCallback<T> = Box<dyn Fn(&Arc<StreamReactor<T>>) + Send + Sync>;

/// Transport-thread callbacks of a stream.
pub struct StreamCallbacks<T> {
    on_item: ItemCallback<T>,
    on_read_closed: Option<StreamCallback<T>>,
    on_end: StreamCallback<T>,
}

impl<T> StreamCallbacks<T> {
    pub fn new<I, E>(on_item: I, on_end: E) -> Self
    where
        I: Fn(&Arc<StreamReactor<T>>, &T) -> ReadDecision + Send + Sync + 'static,
        E: Fn(&Arc<StreamReactor<T>>) + Send + Sync + 'static,
    {
        Self {
            on_item: Box::new(on_item),
            on_read_closed: None,
            on_end: Box::new(on_end),
        }
    }

    /// Called once when the read side closes, before `on_end`.
    pub fn on_read_closed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<StreamReactor<T>>) + Send + Sync + 'static,
    {
        self.on_read_closed = Some(Box::new(callback));
        self
    }
}

enum StreamState {
    Idle,
    Reading(Arc<dyn ReadStream>),
    ItemHeld(Arc<dyn ReadStream>),
    Ended,
}

impl StreamState {
    fn phase(&self) -> StreamPhase {
        match self {
            StreamState::Idle => StreamPhase::Idle,
            StreamState::Reading(_) => StreamPhase::Reading,
            StreamState::ItemHeld(_) => StreamPhase::ItemHeld,
            StreamState::Ended => StreamPhase::Ended,
        }
    }
}

/// Observable phase of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Reading,
    ItemHeld,
    Ended,
}

/// One in-flight server-streaming call.
pub struct StreamReactor<T> {
    handle: CallHandle<T>,
    callbacks: StreamCallbacks<T>,
    state: Mutex<StreamState>,
    timeout: Option<Duration>,
    started: AtomicBool,
    items_received: AtomicUsize,
    fetches_requested: AtomicUsize,
    resumes: AtomicUsize,
}

impl<T: Send + 'static> StreamReactor<T> {
    pub fn new(callbacks: StreamCallbacks<T>) -> Self {
        Self {
            handle: CallHandle::new(),
            callbacks,
            state: Mutex::new(StreamState::Idle),
            timeout: None,
            started: AtomicBool::new(false),
            items_received: AtomicUsize::new(0),
            fetches_requested: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        }
    }

    /// Ask the transport to give up after `timeout`, counted from `start`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Open the stream and request the first item.
    pub fn start<Req, C>(self: &Arc<Self>, channel: &C, request: Req) -> BridgeResult<()>
    where
        C: StreamChannel<Req, T> + ?Sized,
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
            "Starting stream call {}",
            self.call_id()
        );
        let stream = channel.start_stream(ctx, request, Arc::clone(self));

        let mut state = self.lock_state("StreamReactor::start");
        if !matches!(*state, StreamState::Idle) || self.handle.is_terminated() {
            // The transport ended the call before returning.
            return Ok(());
        }
        self.fetch(stream.as_ref());
        *state = StreamState::Reading(stream);
        Ok(())
    }

    /// Move the current item out and, if the stream is held, resume it.
    ///
    /// Returns `None` when no item is waiting. After the stream ended a held
    /// item can still be taken; no further fetch is issued then.
    pub fn take_response(&self) -> Option<T> {
        let item = self.handle.take()?;

        let mut state = self.lock_state("StreamReactor::take_response");
        match std::mem::replace(&mut *state, StreamState::Ended) {
            StreamState::ItemHeld(stream) if !self.handle.is_terminated() => {
                self.resumes.fetch_add(1, Ordering::Relaxed);
                self.fetch(stream.as_ref());
                *state = StreamState::Reading(stream);
            }
            StreamState::ItemHeld(_) => {}
            other => *state = other,
        }
        Some(item)
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.handle.is_cancel_requested()
    }

    pub fn phase(&self) -> StreamPhase {
        self.lock_state("StreamReactor::phase").phase()
    }

    pub fn is_held(&self) -> bool {
        self.phase() == StreamPhase::ItemHeld
    }

    /// Items delivered by the transport so far.
    pub fn items_received(&self) -> usize {
        self.items_received.load(Ordering::Relaxed)
    }

    /// Reads requested from the transport, including the initial one.
    pub fn fetches_requested(&self) -> usize {
        self.fetches_requested.load(Ordering::Relaxed)
    }

    /// Holds released by `take_response`.
    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::Relaxed)
    }

    /// Transport-facing: one item arrived in answer to `start_read`.
    pub fn on_item(self: &Arc<Self>, item: T) {
        let held = {
            let mut state = self.lock_state("StreamReactor::on_item");
            match std::mem::replace(&mut *state, StreamState::Ended) {
                StreamState::Reading(stream) if !self.handle.is_terminated() => {
                    *state = StreamState::ItemHeld(stream);
                    true
                }
                other => {
                    *state = other;
                    false
                }
            }
        };
        if !held {
            debug_assert!(false, "on_item without a pending read on call {}", self.call_id());
            log::warn!(
                target: "rpc_reactor::call",
                "Dropping unexpected item on call {}",
                self.call_id()
            );
            return;
        }
        self.items_received.fetch_add(1, Ordering::Relaxed);

        let decision = self
            .handle
            .publish_and_inspect(item, |item| (self.callbacks.on_item)(self, item))
            .unwrap_or(ReadDecision::Hold);

        if decision == ReadDecision::Continue {
            self.continue_reading();
        }
    }

    /// Transport-facing: the read side closed, no more items will arrive.
    pub fn on_read_closed(self: &Arc<Self>) {
        {
            let _state = self.lock_state("StreamReactor::on_read_closed");
            self.handle.terminate();
        }
        log::trace!(
            target: "rpc_reactor::call",
            "Read side closed on call {}",
            self.call_id()
        );
        if let Some(callback) = &self.callbacks.on_read_closed {
            callback(self);
        }
    }

    /// Transport-facing: the call is over. Delivered exactly once.
    pub fn on_end(self: &Arc<Self>, status: Status) {
        if !self.handle.set_status(status) {
            debug_assert!(false, "on_end delivered twice for call {}", self.call_id());
            log::warn!(
                target: "rpc_reactor::call",
                "Ignoring repeated end for call {}",
                self.call_id()
            );
            return;
        }
        let previous = {
            let mut state = self.lock_state("StreamReactor::on_end");
            self.handle.terminate();
            std::mem::replace(&mut *state, StreamState::Ended)
        };
        if let StreamState::ItemHeld(_) = previous {
            log::debug!(
                target: "rpc_reactor::call",
                "Call {} ended while holding an item",
                self.call_id()
            );
        }
        drop(previous);

        (self.callbacks.on_end)(self);
    }

    /// The item was consumed by the callback: drop it and read the next one.
    fn continue_reading(&self) {
        // A consumer that took the item first has already resumed the stream.
        self.handle.discard();

        let mut state = self.lock_state("StreamReactor::continue_reading");
        match std::mem::replace(&mut *state, StreamState::Ended) {
            StreamState::ItemHeld(stream) if !self.handle.is_terminated() => {
                self.fetch(stream.as_ref());
                *state = StreamState::Reading(stream);
            }
            other => *state = other,
        }
    }

    /// Request the next item. Callers hold the state lock.
    fn fetch(&self, stream: &dyn ReadStream) {
        self.fetches_requested.fetch_add(1, Ordering::Relaxed);
        stream.start_read();
    }

    fn lock_state(&self, context: &str) -> MutexGuard<'_, StreamState> {
        self.state.lock().recover_poison(context)
    }
}

impl<T: Send + 'static> Reactor for StreamReactor<T> {
    fn call_id(&self) -> CallId {
        self.handle.id()
    }

    fn kind(&self) -> CallKind {
        CallKind::Stream
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

impl<T> fmt::Debug for StreamReactor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReactor")
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
    use std::sync::Barrier;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    /// Read stream that only counts requests; items are injected by the test.
    #[derive(Default)]
    struct CountingStream {
        reads: AtomicUsize,
    }

    impl ReadStream for CountingStream {
        fn start_read(&self) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedChannel {
        stream: Arc<CountingStream>,
    }

    impl StreamChannel<(), u32> for ScriptedChannel {
        fn start_stream(
            &self,
            _ctx: CallContext,
            _request: (),
            _reactor: Arc<StreamReactor<u32>>,
        ) -> Arc<dyn ReadStream> {
            self.stream.clone()
        }
    }

    type Started = (
        Arc<StreamReactor<u32>>,
        Arc<CountingStream>,
        Arc<StdMutex<Vec<u32>>>,
    );

    fn started(decision: ReadDecision) -> Started {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let callbacks = StreamCallbacks::new(
            move |_, item: &u32| {
                seen_clone.lock().unwrap().push(*item);
                decision
            },
            |_| {},
        );
        let reactor = Arc::new(StreamReactor::new(callbacks));
        let stream = Arc::new(CountingStream::default());
        let channel = ScriptedChannel {
            stream: stream.clone(),
        };
        reactor.start(&channel, ()).unwrap();
        (reactor, stream, seen)
    }

    #[test]
    fn start_requests_first_item() {
        let (reactor, stream, _) = started(ReadDecision::Hold);
        assert_eq!(stream.reads.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.phase(), StreamPhase::Reading);
        assert_eq!(reactor.fetches_requested(), 1);
    }

    #[test]
    fn held_item_blocks_fetch_until_taken() {
        let (reactor, stream, seen) = started(ReadDecision::Hold);

        reactor.on_item(10);
        assert!(reactor.is_held());
        assert!(reactor.is_ready());
        assert_eq!(stream.reads.load(Ordering::SeqCst), 1, "no fetch while held");
        assert_eq!(*seen.lock().unwrap(), vec![10]);

        assert_eq!(reactor.take_response(), Some(10));
        assert_eq!(reactor.phase(), StreamPhase::Reading);
        assert_eq!(stream.reads.load(Ordering::SeqCst), 2);
        assert_eq!(reactor.resumes(), 1);

        assert_eq!(reactor.take_response(), None);
        assert_eq!(stream.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn continue_fetches_immediately_and_drops_item() {
        let (reactor, stream, seen) = started(ReadDecision::Continue);

        reactor.on_item(1);
        reactor.on_item(2);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(stream.reads.load(Ordering::SeqCst), 3);
        assert_eq!(reactor.phase(), StreamPhase::Reading);
        assert!(!reactor.is_ready());
        assert_eq!(reactor.take_response(), None);
        assert_eq!(reactor.resumes(), 0);
    }

    #[test]
    fn end_while_held_keeps_item_but_stops_fetching() {
        let (reactor, stream, _) = started(ReadDecision::Hold);
        reactor.on_item(5);

        reactor.on_end(Status::cancelled("gave up"));
        assert_eq!(reactor.phase(), StreamPhase::Ended);
        assert!(reactor.is_terminated());

        assert_eq!(reactor.take_response(), Some(5));
        assert_eq!(stream.reads.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.phase(), StreamPhase::Ended);
        assert_eq!(reactor.resumes(), 0);
    }

    #[test]
    fn read_closed_prevents_further_fetches() {
        let (reactor, stream, _) = started(ReadDecision::Continue);
        reactor.on_read_closed();
        assert!(reactor.is_terminated());

        reactor.on_end(Status::ok());
        assert_eq!(reactor.status(), Some(Status::ok()));
        assert_eq!(stream.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn take_inside_item_callback_finds_nothing() {
        let inner = Arc::new(StdMutex::new(Vec::new()));
        let inner_clone = inner.clone();
        let callbacks = StreamCallbacks::new(
            move |reactor: &Arc<StreamReactor<u32>>, _: &u32| {
                inner_clone.lock().unwrap().push(reactor.take_response());
                ReadDecision::Continue
            },
            |_| {},
        );
        let reactor = Arc::new(StreamReactor::new(callbacks));
        let stream = Arc::new(CountingStream::default());
        let channel = ScriptedChannel {
            stream: stream.clone(),
        };
        reactor.start(&channel, ()).unwrap();

        reactor.on_item(1);

        assert_eq!(*inner.lock().unwrap(), vec![None]);
        assert_eq!(stream.reads.load(Ordering::SeqCst), 2);
        assert_eq!(reactor.phase(), StreamPhase::Reading);
        assert!(!reactor.is_ready());
    }

    #[test]
    fn no_read_requested_after_end_races_with_take() {
        for _ in 0..200 {
            let (reactor, stream, _) = started(ReadDecision::Hold);
            reactor.on_item(1);
            let barrier = Arc::new(Barrier::new(2));

            let consumer = {
                let reactor = reactor.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    reactor.take_response()
                })
            };
            barrier.wait();
            reactor.on_end(Status::cancelled("race"));
            let reads_at_end = stream.reads.load(Ordering::SeqCst);
            let fetches_at_end = reactor.fetches_requested();

            assert_eq!(consumer.join().unwrap(), Some(1));
            assert_eq!(stream.reads.load(Ordering::SeqCst), reads_at_end);
            assert_eq!(reactor.fetches_requested(), fetches_at_end);
            assert_eq!(reactor.phase(), StreamPhase::Ended);
        }
    }

    #[test]
    fn callbacks_fire_in_order() {
        let log = Arc::new(StdMutex::new(Vec::<&'static str>::new()));
        let (item_log, closed_log, end_log) = (log.clone(), log.clone(), log.clone());
        let callbacks = StreamCallbacks::new(
            move |_, _: &u32| {
                item_log.lock().unwrap().push("item");
                ReadDecision::Continue
            },
            move |_| end_log.lock().unwrap().push("end"),
        )
        .on_read_closed(move |_| closed_log.lock().unwrap().push("closed"));
        let reactor = Arc::new(StreamReactor::new(callbacks));
        let channel = ScriptedChannel {
            stream: Arc::new(CountingStream::default()),
        };
        reactor.start(&channel, ()).unwrap();

        reactor.on_item(1);
        reactor.on_read_closed();
        reactor.on_end(Status::ok());

        assert_eq!(*log.lock().unwrap(), vec!["item", "closed", "end"]);
    }
}

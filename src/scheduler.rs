//! Single-consumer event scheduler (Active Object).
//!
//! Transport threads enqueue named events through an [`EventSender`]; one
//! consumer thread dequeues them and runs the handler registered under the
//! event's name. Handlers therefore never run concurrently with each other
//! and can share state without their own synchronization.
//!
//! # Run modes
//!
//! - [`RunMode::Blocking`]: the calling thread becomes the consumer until
//!   [`Scheduler::halt`].
//! - [`RunMode::Background`]: a dedicated, named thread becomes the consumer
//!   and `run` returns immediately.
//!
//! # Halting
//!
//! `halt` enqueues a stop marker. With [`HaltPolicy::Drain`] every event
//! enqueued before the marker is dispatched first; with
//! [`HaltPolicy::Abandon`] the loop stops before the next event. Either way,
//! undispatched events stay queued and a later `run` picks them up.
//!
//! # Handler failures
//!
//! Errors and panics raised by handlers follow [`HandlerErrorPolicy`]:
//! logged (default) or returned from `run`/`join`, stopping the loop.
//!
//! The queue is a tokio unbounded mpsc channel consumed with
//! `blocking_recv`, so `run(RunMode::Blocking)` must not be called from
//! inside an async runtime.

mod event;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;

pub use event::{Event, EventSender, Payload};
use event::Message;

pub use crate::config::{HaltPolicy, HandlerErrorPolicy, SchedulerConfig};
use crate::call::Reactor;
use crate::error::{BridgeError, BridgeResult, HandlerResult, LockResultExt};

/// Logging target for the scheduler.
const LOG_TARGET: &str = "rpc_reactor::scheduler";

type Handler = Box<dyn FnMut(&Event) -> HandlerResult + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// The calling thread consumes events until halted.
    Blocking,
    /// A dedicated thread consumes events; `run` returns immediately.
    Background,
}

/// Explicitly owned event loop. Create one per application and hand it (or
/// its [`EventSender`]) to the code that needs it.
pub struct Scheduler {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<BridgeResult<()>>>>,
}

struct Shared {
    config: SchedulerConfig,
    handlers: Mutex<HashMap<Arc<str>, Arc<Mutex<Handler>>>>,
    sender: EventSender,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pending: Arc<AtomicUsize>,
    running: AtomicBool,
    halt_requested: AtomicBool,
    /// Incremented per run so stop markers left over from a previous run are
    /// ignored.
    epoch: AtomicU64,
    consumer_thread: Mutex<Option<ThreadId>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let shared = Shared {
            config,
            handlers: Mutex::new(HashMap::new()),
            sender: EventSender::new(tx, pending.clone()),
            receiver: Mutex::new(Some(rx)),
            pending,
            running: AtomicBool::new(false),
            halt_requested: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            consumer_thread: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            consumer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Register the handler for events named `name`.
    ///
    /// Each name may be registered once for the lifetime of the scheduler.
    /// Handlers may be registered before or after `run`.
    pub fn register_handler<F>(&self, name: impl Into<Arc<str>>, handler: F) -> BridgeResult<()>
    where
        F: FnMut(&Event) -> HandlerResult + Send + 'static,
    {
        let name = name.into();
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .recover_poison("Scheduler::register_handler");
        if handlers.contains_key(&name) {
            log::error!(
                target: LOG_TARGET,
                "Refusing second handler for event {}",
                name
            );
            return Err(BridgeError::duplicate_handler(name.as_ref()));
        }
        log::debug!(target: LOG_TARGET, "Registered handler for {}", name);
        handlers.insert(name, Arc::new(Mutex::new(Box::new(handler))));
        Ok(())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.shared
            .handlers
            .lock()
            .recover_poison("Scheduler::has_handler")
            .contains_key(name)
    }

    /// Enqueue side of the scheduler, for transport-thread callbacks.
    pub fn sender(&self) -> EventSender {
        self.shared.sender.clone()
    }

    pub fn enqueue(&self, name: impl Into<Arc<str>>, payload: Option<Payload>) -> BridgeResult<()> {
        self.shared.sender.enqueue(name, payload)
    }

    pub fn enqueue_call<R: Reactor>(
        &self,
        name: impl Into<Arc<str>>,
        reactor: &Arc<R>,
    ) -> BridgeResult<()> {
        self.shared.sender.enqueue_call(name, reactor)
    }

    /// Events enqueued but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether the current thread is the consumer thread. Meant for
    /// assertions inside handlers and callbacks.
    pub fn is_consumer_thread(&self) -> bool {
        *self
            .shared
            .consumer_thread
            .lock()
            .recover_poison("Scheduler::is_consumer_thread")
            == Some(thread::current().id())
    }

    /// Start consuming events.
    ///
    /// In blocking mode this returns once halted, with the loop's outcome. In
    /// background mode it returns as soon as the consumer thread is spawned;
    /// the outcome is available from [`Scheduler::join`].
    pub fn run(&self, mode: RunMode) -> BridgeResult<()> {
        let (receiver, epoch) = self.shared.claim()?;

        match mode {
            RunMode::Blocking => consume(&self.shared, receiver, epoch),
            RunMode::Background => {
                // Reap a consumer that already stopped on its own.
                if let Some(previous) = self.take_consumer() {
                    let _ = previous.join();
                }
                let shared = Arc::clone(&self.shared);
                let spawned = thread::Builder::new()
                    .name(self.shared.config.thread_name.clone())
                    .spawn(move || consume(&shared, receiver, epoch));
                match spawned {
                    Ok(handle) => {
                        *self.consumer.lock().recover_poison("Scheduler::run") = Some(handle);
                        Ok(())
                    }
                    Err(err) => {
                        // The receiver moved into the failed closure; the
                        // scheduler cannot run again.
                        self.shared.running.store(false, Ordering::Release);
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Ask the consumer loop to stop. Idempotent and callable from any
    /// thread, including from a handler.
    ///
    /// Returns `false` when no consumer is running.
    pub fn halt(&self) -> bool {
        self.shared.halt()
    }

    /// Wait for the background consumer to stop and return its outcome.
    ///
    /// Returns `Ok(())` immediately if no background consumer exists.
    pub fn join(&self) -> BridgeResult<()> {
        let Some(handle) = self.take_consumer() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            // Joining from inside a handler would deadlock.
            *self.consumer.lock().recover_poison("Scheduler::join") = Some(handle);
            return Ok(());
        }
        match handle.join() {
            Ok(result) => result,
            Err(panic) => Err(BridgeError::handler(
                "<consumer>",
                panic_message(panic.as_ref()),
            )),
        }
    }

    fn take_consumer(&self) -> Option<JoinHandle<BridgeResult<()>>> {
        self.consumer
            .lock()
            .recover_poison("Scheduler::take_consumer")
            .take()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.halt();
        if let Err(err) = self.join() {
            log::warn!(target: LOG_TARGET, "Consumer stopped with error: {}", err);
        }
    }
}

impl Shared {
    /// Take the receiver for a new run.
    fn claim(&self) -> BridgeResult<(mpsc::UnboundedReceiver<Message>, u64)> {
        let mut slot = self.receiver.lock().recover_poison("Scheduler::claim");
        if self.running.load(Ordering::Acquire) {
            return Err(BridgeError::AlreadyRunning);
        }
        let receiver = slot.take().ok_or(BridgeError::SchedulerClosed)?;
        self.running.store(true, Ordering::Release);
        self.halt_requested.store(false, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        Ok((receiver, epoch))
    }

    fn halt(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if self.halt_requested.swap(true, Ordering::AcqRel) {
            return true;
        }
        log::debug!(target: LOG_TARGET, "Halt requested");
        self.sender.send_halt(self.epoch.load(Ordering::Acquire))
    }

    fn dispatch(&self, event: &Event) -> BridgeResult<()> {
        let handler = self
            .handlers
            .lock()
            .recover_poison("Scheduler::dispatch")
            .get(event.name())
            .cloned();
        let Some(handler) = handler else {
            return Err(BridgeError::unknown_event(event.name()));
        };

        let mut handler = handler.lock().recover_poison("Scheduler::dispatch handler");
        match catch_unwind(AssertUnwindSafe(|| (*handler)(event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BridgeError::handler(event.name(), err.to_string())),
            Err(panic) => Err(BridgeError::handler(
                event.name(),
                format!("panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }
}

/// The consumer loop. Runs on exactly one thread at a time.
fn consume(
    shared: &Shared,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    epoch: u64,
) -> BridgeResult<()> {
    *shared
        .consumer_thread
        .lock()
        .recover_poison("Scheduler::consume") = Some(thread::current().id());
    log::debug!(
        target: LOG_TARGET,
        "Consumer started on thread {:?} (run {})",
        thread::current().name(),
        epoch
    );

    let result = loop {
        if shared.config.halt_policy == HaltPolicy::Abandon
            && shared.halt_requested.load(Ordering::Acquire)
        {
            break Ok(());
        }

        let Some(message) = receiver.blocking_recv() else {
            // Unreachable while `shared` owns a sender, kept for safety.
            break Ok(());
        };
        let event = match message {
            Message::Halt(marker) if marker == epoch => break Ok(()),
            Message::Halt(_) => continue,
            Message::Event(event) => event,
        };
        shared.pending.fetch_sub(1, Ordering::AcqRel);

        if let Err(err) = shared.dispatch(&event) {
            match shared.config.error_policy {
                HandlerErrorPolicy::LogAndContinue => {
                    log::error!(target: LOG_TARGET, "{}", err);
                }
                HandlerErrorPolicy::Propagate => break Err(err),
            }
        }
    };

    log::debug!(target: LOG_TARGET, "Consumer stopped (run {})", epoch);
    *shared
        .consumer_thread
        .lock()
        .recover_poison("Scheduler::consume") = None;
    *shared.receiver.lock().recover_poison("Scheduler::consume") = Some(receiver);
    shared.halt_requested.store(false, Ordering::Release);
    shared.running.store(false, Ordering::Release);
    result
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Events flowing from transport threads to the consumer thread.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::call::{CallId, Reactor};
use crate::error::{BridgeError, BridgeResult};

/// Opaque event payload, normally the reactor that produced the event.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A named, immutable notification for the consumer thread.
#[derive(Clone)]
pub struct Event {
    name: Arc<str>,
    payload: Option<Payload>,
    call_id: Option<CallId>,
}

impl Event {
    pub fn new(name: impl Into<Arc<str>>, payload: Option<Payload>) -> Self {
        Self {
            name: name.into(),
            payload,
            call_id: None,
        }
    }

    /// Event carrying a reactor, tagged with its call id.
    pub fn for_call<R: Reactor>(name: impl Into<Arc<str>>, reactor: &Arc<R>) -> Self {
        let payload: Payload = reactor.clone();
        Self {
            name: name.into(),
            payload: Some(payload),
            call_id: Some(reactor.call_id()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the call that produced this event, if it came from a reactor.
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    /// Payload downcast to its concrete type.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone()?.downcast::<T>().ok()
    }

    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref::<T>()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("call_id", &self.call_id)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

pub(super) enum Message {
    Event(Event),
    /// Stop marker for the run identified by the epoch.
    Halt(u64),
}

/// Cloneable enqueue side of a scheduler, safe to use from any thread.
///
/// Sends never block: the queue is unbounded, so transport threads always
/// return immediately.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Message>,
    pending: Arc<AtomicUsize>,
}

impl EventSender {
    pub(super) fn new(tx: mpsc::UnboundedSender<Message>, pending: Arc<AtomicUsize>) -> Self {
        Self { tx, pending }
    }

    pub fn enqueue(&self, name: impl Into<Arc<str>>, payload: Option<Payload>) -> BridgeResult<()> {
        self.enqueue_event(Event::new(name, payload))
    }

    /// Enqueue an event carrying `reactor`. This is what transport-thread
    /// callbacks normally do.
    pub fn enqueue_call<R: Reactor>(
        &self,
        name: impl Into<Arc<str>>,
        reactor: &Arc<R>,
    ) -> BridgeResult<()> {
        self.enqueue_event(Event::for_call(name, reactor))
    }

    pub fn enqueue_event(&self, event: Event) -> BridgeResult<()> {
        log::trace!(
            target: "rpc_reactor::scheduler",
            "Enqueue {} (call {:?})",
            event.name(),
            event.call_id()
        );
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Message::Event(event)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(BridgeError::SchedulerClosed);
        }
        Ok(())
    }

    pub(super) fn send_halt(&self, epoch: u64) -> bool {
        self.tx.send(Message::Halt(epoch)).is_ok()
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

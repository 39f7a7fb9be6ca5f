//! Shared state of one outstanding call.
//!
//! The payload slot changes hands between two threads:
//!
//! ```text
//! transport thread                      application thread
//! ----------------                      ------------------
//! publish(item)
//!   slot = Some(item)
//!   ready.store(true, Release)  ─────►  take()
//!                                         ready: true -> false (AcqRel)
//!                                         slot.take()
//! ```
//!
//! The producer only writes the slot while `ready` is false, the consumer only
//! reads it after winning the `ready` exchange. A stream keeps the slot locked
//! while its `on_item` callback inspects the item, so a consumer that wins the
//! exchange meanwhile waits for the callback to return. A `take` issued from
//! inside that callback finds nothing instead of waiting on itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};

use tokio_util::sync::CancellationToken;

use super::CallId;
use crate::error::LockResultExt;
use crate::status::Status;

pub struct CallHandle<T> {
    id: CallId,
    response: Mutex<Option<T>>,
    /// Thread currently inspecting the published item with the slot locked.
    inspector: Mutex<Option<ThreadId>>,
    /// Terminal outcome, written once by the transport thread.
    status: OnceLock<Status>,
    /// Set by the transport thread when `response` holds an item, cleared by
    /// the consumer when it takes it.
    ready: AtomicBool,
    /// Once set, no further transport operation may be issued for this call.
    terminated: AtomicBool,
    cancel: CancellationToken,
}

impl<T> CallHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            id: CallId::next(),
            response: Mutex::new(None),
            inspector: Mutex::new(None),
            status: OnceLock::new(),
            ready: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Token shared with the transport through the call context.
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Best-effort cancel. Idempotent and callable from any thread.
    pub fn try_cancel(&self) {
        if !self.cancel.is_cancelled() {
            log::debug!(
                target: "rpc_reactor::call",
                "Cancel requested for call {}",
                self.id
            );
        }
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether an item is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Terminal status, `None` while the call is pending.
    pub fn status(&self) -> Option<Status> {
        self.status.get().cloned()
    }

    /// Store an item and publish it to the consumer.
    pub(crate) fn publish(&self, item: T) {
        let mut slot = self.lock_slot("CallHandle::publish");
        *slot = Some(item);
        self.ready.store(true, Ordering::Release);
    }

    /// Publish `item`, then run `inspect` on it before the consumer can move
    /// it out.
    pub(crate) fn publish_and_inspect<R>(
        &self,
        item: T,
        inspect: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let mut slot = self.lock_slot("CallHandle::publish_and_inspect");
        *slot = Some(item);
        self.ready.store(true, Ordering::Release);

        *self.lock_inspector() = Some(thread::current().id());
        let _inspecting = InspectorReset(&self.inspector);
        slot.as_ref().map(inspect)
    }

    /// Move the published item out, if any.
    ///
    /// Returns `None` when called from inside `publish_and_inspect`'s
    /// callback; the item stays published.
    pub(crate) fn take(&self) -> Option<T> {
        if *self.lock_inspector() == Some(thread::current().id()) {
            log::warn!(
                target: "rpc_reactor::call",
                "Item of call {} taken while its callback is still inspecting it",
                self.id
            );
            return None;
        }
        if self
            .ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.lock_slot("CallHandle::take").take()
    }

    /// Drop the published item without handing it to the consumer.
    ///
    /// Returns `false` when the consumer already took it.
    pub(crate) fn discard(&self) -> bool {
        self.take().is_some()
    }

    /// Record the terminal status. Only the first call has an effect.
    pub(crate) fn set_status(&self, status: Status) -> bool {
        self.status.set(status).is_ok()
    }

    /// Mark the call terminated. Returns `true` on the first transition.
    pub(crate) fn terminate(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    fn lock_slot(&self, context: &str) -> MutexGuard<'_, Option<T>> {
        self.response.lock().recover_poison(context)
    }

    fn lock_inspector(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.inspector.lock().recover_poison("CallHandle::inspector")
    }
}

/// Clears the inspector on scope exit, unwinding included.
struct InspectorReset<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for InspectorReset<'_> {
    fn drop(&mut self) {
        *self.0.lock().recover_poison("InspectorReset::drop") = None;
    }
}

impl<T> Drop for CallHandle<T> {
    fn drop(&mut self) {
        // Nobody is left to consume results; let the transport stop early.
        self.cancel.cancel();
    }
}

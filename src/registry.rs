//! Per-operation admission control.
//!
//! A [`CallRegistry`] maps an operation key (for example an RPC method name)
//! to at most one live call. Starting an operation whose key is taken is
//! rejected with [`BridgeError::Busy`]; it is never queued.
//!
//! Admission happens in two steps so the reactor can be built and started
//! only after the key was won:
//!
//! ```ignore
//! let slot = registry.try_acquire("ListFeatures")?;
//! let reactor = Arc::new(StreamReactor::new(callbacks));
//! reactor.start(&channel, request)?;
//! slot.occupy(reactor);
//! ```
//!
//! Dropping the [`Slot`] without occupying it gives the key back.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::call::{CallId, Reactor};
use crate::error::{BridgeError, BridgeResult};

const LOG_TARGET: &str = "rpc_reactor::registry";

enum SlotState {
    /// Key won, reactor not registered yet.
    Reserved,
    Live(Arc<dyn Reactor>),
}

/// Single-flight registry of live calls, keyed by operation.
pub struct CallRegistry<K>
where
    K: Eq + Hash,
{
    calls: DashMap<K, SlotState>,
}

impl<K> CallRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Reserve `key` if no call holds it.
    ///
    /// Concurrent callers racing for the same key get exactly one `Ok`. A
    /// rejected caller leaves the registry untouched.
    pub fn try_acquire(&self, key: K) -> BridgeResult<Slot<'_, K>> {
        match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let call_id = match entry.get() {
                    SlotState::Live(reactor) => Some(reactor.call_id()),
                    SlotState::Reserved => None,
                };
                log::debug!(
                    target: LOG_TARGET,
                    "Rejecting {:?}: call {:?} in flight",
                    key,
                    call_id
                );
                Err(BridgeError::busy(format!("{key:?}"), call_id))
            }
            Entry::Vacant(entry) => {
                entry.insert(SlotState::Reserved);
                Ok(Slot {
                    registry: self,
                    key: Some(key),
                })
            }
        }
    }

    /// Clear the live call under `key`, whichever call it is.
    ///
    /// A pending reservation is left alone: only its [`Slot`] can occupy or
    /// abandon it.
    pub fn release(&self, key: &K) -> Option<Arc<dyn Reactor>> {
        let (_, state) = self
            .calls
            .remove_if(key, |_, state| matches!(state, SlotState::Live(_)))?;
        match state {
            SlotState::Live(reactor) => {
                log::debug!(
                    target: LOG_TARGET,
                    "Released {:?} (call {})",
                    key,
                    reactor.call_id()
                );
                Some(reactor)
            }
            SlotState::Reserved => None,
        }
    }

    /// Clear `key` only if it still holds call `call_id`.
    ///
    /// Events from a call that was already replaced must not release its
    /// successor; this returns `false` for them.
    pub fn release_call(&self, key: &K, call_id: CallId) -> bool {
        let removed = self
            .calls
            .remove_if(key, |_, state| {
                matches!(state, SlotState::Live(r) if r.call_id() == call_id)
            })
            .is_some();
        if removed {
            log::debug!(target: LOG_TARGET, "Released {:?} (call {})", key, call_id);
        } else {
            log::debug!(
                target: LOG_TARGET,
                "Stale release of {:?} by call {}",
                key,
                call_id
            );
        }
        removed
    }

    /// Whether `call_id` is the live call under `key`.
    pub fn is_current(&self, key: &K, call_id: CallId) -> bool {
        self.calls
            .get(key)
            .is_some_and(|state| matches!(&*state, SlotState::Live(r) if r.call_id() == call_id))
    }

    /// Whether `key` is reserved or holds a live call.
    pub fn is_busy(&self, key: &K) -> bool {
        self.calls.contains_key(key)
    }

    /// The live call under `key`.
    pub fn get(&self, key: &K) -> Option<Arc<dyn Reactor>> {
        match &*self.calls.get(key)? {
            SlotState::Live(reactor) => Some(Arc::clone(reactor)),
            SlotState::Reserved => None,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Request cancellation of every live call. Entries stay in place; they
    /// are released by whoever handles each call's terminal event.
    pub fn cancel_all(&self) -> usize {
        // Collect first so no shard lock is held while cancelling.
        let live: Vec<Arc<dyn Reactor>> = self
            .calls
            .iter()
            .filter_map(|entry| match entry.value() {
                SlotState::Live(reactor) => Some(Arc::clone(reactor)),
                SlotState::Reserved => None,
            })
            .collect();
        for reactor in &live {
            reactor.try_cancel();
        }
        if !live.is_empty() {
            log::info!(target: LOG_TARGET, "Cancelled {} live call(s)", live.len());
        }
        live.len()
    }

    /// Turn the reservation under `key` into a live entry. Refuses, and
    /// cancels `reactor`, when the entry is no longer a reservation.
    fn occupy(&self, key: &K, reactor: Arc<dyn Reactor>) -> bool {
        let call_id = reactor.call_id();
        let occupied = match self.calls.get_mut(key) {
            Some(mut state) if matches!(*state, SlotState::Reserved) => {
                *state = SlotState::Live(Arc::clone(&reactor));
                true
            }
            _ => false,
        };
        if occupied {
            log::debug!(target: LOG_TARGET, "{:?} now held by call {}", key, call_id);
        } else {
            log::warn!(
                target: LOG_TARGET,
                "Reservation of {:?} lost before call {} was registered; cancelling it",
                key,
                call_id
            );
            reactor.try_cancel();
        }
        occupied
    }

    fn abandon(&self, key: &K) {
        self.calls
            .remove_if(key, |_, state| matches!(state, SlotState::Reserved));
    }
}

impl<K> Default for CallRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for CallRegistry<K>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .calls
            .iter()
            .map(|entry| format!("{:?}", entry.key()))
            .collect();
        f.debug_struct("CallRegistry").field("keys", &keys).finish()
    }
}

/// A won reservation. Turn it into a live entry with [`Slot::occupy`].
#[must_use = "dropping a slot releases the reservation"]
#[derive(Debug)]
pub struct Slot<'a, K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    registry: &'a CallRegistry<K>,
    key: Option<K>,
}

impl<K> Slot<'_, K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Register `reactor` as the live call under this slot's key.
    ///
    /// A live entry is never overwritten; if the reservation is gone the
    /// reactor is cancelled instead of registered.
    pub fn occupy<R: Reactor>(mut self, reactor: Arc<R>) -> CallId {
        let call_id = reactor.call_id();
        if let Some(key) = self.key.take() {
            self.registry.occupy(&key, reactor);
        }
        call_id
    }
}

impl<K> Drop for Slot<'_, K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            log::debug!(target: LOG_TARGET, "Reservation of {:?} abandoned", key);
            self.registry.abandon(&key);
        }
    }
}

//! Per-call reactors bridging transport threads and the application thread.
//!
//! Two reactor kinds exist, [`UnaryReactor`] and [`StreamReactor`]. Code that
//! does not care which one it holds goes through the [`Reactor`] capability
//! trait (registry, scheduler) or the closed [`Call`] enum (application code
//! that also wants the response).

mod handle;
mod id;
mod stream;
mod unary;

use std::sync::Arc;

pub use id::CallId;
pub use stream::{ReadDecision, StreamCallbacks, StreamPhase, StreamReactor};
pub use unary::UnaryReactor;

use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    Stream,
}

/// Application-visible progress of a call.
///
/// A call refused by admission control never gets a state: that case is
/// reported as [`BridgeError::Busy`](crate::error::BridgeError::Busy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Succeeded,
    Failed(Status),
}

/// Capabilities shared by every reactor.
pub trait Reactor: Send + Sync + 'static {
    fn call_id(&self) -> CallId;

    fn kind(&self) -> CallKind;

    /// Best-effort cancel. Thread-safe and idempotent; the call may still
    /// complete normally.
    fn try_cancel(&self);

    /// Terminal status; `None` while pending.
    fn status(&self) -> Option<Status>;

    /// Whether the transport may no longer be asked for anything.
    fn is_terminated(&self) -> bool;

    fn state(&self) -> CallState {
        match self.status() {
            None => CallState::Pending,
            Some(status) if status.is_ok() => CallState::Succeeded,
            Some(status) => CallState::Failed(status),
        }
    }
}

/// A call of either kind producing responses of type `T`.
pub enum Call<T> {
    Unary(Arc<UnaryReactor<T>>),
    Stream(Arc<StreamReactor<T>>),
}

impl<T: Send + 'static> Call<T> {
    /// Move the current response out; see the reactor's `take_response`.
    pub fn take_response(&self) -> Option<T> {
        match self {
            Call::Unary(reactor) => reactor.take_response(),
            Call::Stream(reactor) => reactor.take_response(),
        }
    }

    pub fn as_reactor(&self) -> Arc<dyn Reactor> {
        match self {
            Call::Unary(reactor) => reactor.clone(),
            Call::Stream(reactor) => reactor.clone(),
        }
    }
}

impl<T> Clone for Call<T> {
    fn clone(&self) -> Self {
        match self {
            Call::Unary(reactor) => Call::Unary(Arc::clone(reactor)),
            Call::Stream(reactor) => Call::Stream(Arc::clone(reactor)),
        }
    }
}

impl<T: Send + 'static> Reactor for Call<T> {
    fn call_id(&self) -> CallId {
        match self {
            Call::Unary(reactor) => reactor.call_id(),
            Call::Stream(reactor) => reactor.call_id(),
        }
    }

    fn kind(&self) -> CallKind {
        match self {
            Call::Unary(_) => CallKind::Unary,
            Call::Stream(_) => CallKind::Stream,
        }
    }

    fn try_cancel(&self) {
        match self {
            Call::Unary(reactor) => reactor.try_cancel(),
            Call::Stream(reactor) => reactor.try_cancel(),
        }
    }

    fn status(&self) -> Option<Status> {
        match self {
            Call::Unary(reactor) => reactor.status(),
            Call::Stream(reactor) => reactor.status(),
        }
    }

    fn is_terminated(&self) -> bool {
        match self {
            Call::Unary(reactor) => reactor.is_terminated(),
            Call::Stream(reactor) => reactor.is_terminated(),
        }
    }
}

impl<T> From<Arc<UnaryReactor<T>>> for Call<T> {
    fn from(reactor: Arc<UnaryReactor<T>>) -> Self {
        Call::Unary(reactor)
    }
}

impl<T> From<Arc<StreamReactor<T>>> for Call<T> {
    fn from(reactor: Arc<StreamReactor<T>>) -> Self {
        Call::Stream(reactor)
    }
}

//! Error handling types for rpc-reactor
//!
//! Transport failures are not errors here: they travel as [`Status`] data on
//! the reactor that owns the call. This module covers what the bridge itself
//! can reject: admission conflicts, scheduler misuse and configuration.
//!
//! [`Status`]: crate::status::Status

use std::sync::PoisonError;
use thiserror::Error;

use crate::call::CallId;

/// Error returned by an application handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by application handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Comprehensive error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A call is already in flight for this operation key
    #[error("Operation {key} is busy")]
    Busy {
        key: String,
        /// Call occupying the key, `None` while the slot is only reserved
        call_id: Option<CallId>,
    },

    /// A handler was registered twice under the same event name
    #[error("Handler already registered for event: {name}")]
    DuplicateHandler { name: String },

    /// An event was dispatched for which no handler exists
    #[error("No handler registered for event: {name}")]
    UnknownEvent { name: String },

    /// The scheduler already has a consumer
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// A reactor was started twice
    #[error("Call {call_id} was already started")]
    AlreadyStarted { call_id: CallId },

    /// The scheduler's queue is gone
    #[error("Scheduler is closed")]
    SchedulerClosed,

    /// A handler failed while the scheduler propagates handler errors
    #[error("Handler for event {name} failed: {message}")]
    Handler { name: String, message: String },

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Helper trait to recover from poisoned locks.
pub trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock, logging which operation did it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "rpc_reactor::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Helper functions for common error patterns
impl BridgeError {
    /// Create a busy error for an operation key
    pub fn busy(key: impl Into<String>, call_id: Option<CallId>) -> Self {
        BridgeError::Busy {
            key: key.into(),
            call_id,
        }
    }

    /// Create a duplicate handler error
    pub fn duplicate_handler(name: impl Into<String>) -> Self {
        BridgeError::DuplicateHandler { name: name.into() }
    }

    /// Create an unknown event error
    pub fn unknown_event(name: impl Into<String>) -> Self {
        BridgeError::UnknownEvent { name: name.into() }
    }

    /// Create a handler failure error
    pub fn handler(name: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Handler {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config {
            message: message.into(),
        }
    }

    /// Whether this error is an admission conflict the caller may retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, BridgeError::Busy { .. })
    }
}

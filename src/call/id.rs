//! Generation numbers identifying calls.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of call ids. Starts at 1 so that 0 never names a live call.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one call.
///
/// Ids are never reused, so an event carrying a `CallId` can be compared
/// against the call currently registered for an operation to detect events
/// from a call that was already released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    /// Allocate the next id in the sequence.
    pub(crate) fn next() -> Self {
        Self(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

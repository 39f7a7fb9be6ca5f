//! Seam between reactors and the RPC transport.
//!
//! The transport is an external collaborator: it runs calls on its own
//! worker threads and reports back by invoking the reactor's transport-facing
//! methods (`on_done`, `on_item`, `on_read_closed`, `on_end`). The reactors
//! only ever ask three things of it: start a unary call, start a stream, and
//! fetch the next item of a stream.
//!
//! # Contract for implementors
//!
//! - Never block the caller. `start_unary`, `start_stream` and
//!   [`ReadStream::start_read`] must return before any reactor callback runs.
//! - Deliver exactly one terminal callback per call (`on_done` for unary,
//!   `on_end` for streams), including for calls cancelled before they started.
//! - Deliver at most one `on_item` per `start_read`.
//! - Tolerate `start_read` after the stream ended (ignore it).
//! - Watch [`CallContext::cancellation`] and [`CallContext::deadline`].

pub mod mem;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::call::{CallId, StreamReactor, UnaryReactor};

pub use mem::{MemChannel, MemStream, MemUnary};

/// Per-call information handed to the transport.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: CallId,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(call_id: CallId, cancellation: CancellationToken) -> Self {
        Self {
            call_id,
            cancellation,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Cancelled when the application calls `try_cancel` or drops the call.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time left before the deadline, `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Transport able to run single-response calls.
pub trait UnaryChannel<Req, Resp>: Send + Sync {
    /// Start a call. Completion is reported through `reactor.on_done`.
    fn start_unary(&self, ctx: CallContext, request: Req, reactor: Arc<UnaryReactor<Resp>>);
}

/// Transport side of one running stream.
pub trait ReadStream: Send + Sync {
    /// Ask for the next item. The answer arrives as `on_item` or, when the
    /// stream is exhausted, `on_read_closed`.
    fn start_read(&self);
}

/// Transport able to run server-streaming calls.
pub trait StreamChannel<Req, Resp>: Send + Sync {
    /// Start a stream. No item is produced before the first `start_read`.
    fn start_stream(
        &self,
        ctx: CallContext,
        request: Req,
        reactor: Arc<StreamReactor<Resp>>,
    ) -> Arc<dyn ReadStream>;
}

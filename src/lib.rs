//! Bridge between callback-driven RPC reactors and a single application
//! thread.
//!
//! Transport threads complete calls on [`UnaryReactor`]s and
//! [`StreamReactor`]s; their callbacks enqueue named [`Event`]s on a
//! [`Scheduler`], which dispatches them one at a time on the application
//! thread. Streams pause after every item until the application takes it.
//! A [`CallRegistry`] keeps at most one live call per operation.

pub mod call;
pub mod channel;
pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod status;

pub use call::{
    Call, CallId, CallKind, CallState, ReadDecision, Reactor, StreamCallbacks, StreamPhase,
    StreamReactor, UnaryReactor,
};
pub use channel::{CallContext, MemChannel, ReadStream, StreamChannel, UnaryChannel};
pub use config::Settings;
pub use error::{BridgeError, BridgeResult, HandlerError, HandlerResult};
pub use registry::{CallRegistry, Slot};
pub use scheduler::{Event, EventSender, Payload, RunMode, Scheduler};
pub use status::{Status, StatusCode};

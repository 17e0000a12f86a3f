//! Stream sessions
//!
//! - [`Session`]: per-connection state machine
//! - [`PipelineCoordinator`]: starts and stops the shared pipeline around active streams
//! - [`Multiplexer`]: ties sessions, the poll set and the coordinator together
//! - [`Transport`]: what the HTTP engine must provide per connection

pub mod coordinator;
pub mod event;
pub mod multiplexer;
pub mod state;
pub mod transport;

pub use coordinator::PipelineCoordinator;
pub use event::{Disposition, HttpEvent, Readiness};
pub use multiplexer::Multiplexer;
pub use state::{Session, SessionId, SessionPhase};
pub use transport::{ResponseHead, Transport, STATUS_NOT_FOUND, STATUS_OK};

//! Live Ogg audio stream multiplexer
//!
//! Serves `GET /streams/<id>.ogg` requests from a single-threaded event loop.
//! Each stream is backed by a receiver of a shared signal-processing
//! pipeline; the pipeline runs only while at least one stream is being
//! listened to.
//!
//! ```text
//!   HTTP engine ──HttpEvent──► Multiplexer ──► StreamRegistry ──► Receiver
//!        ▲                        │  │
//!        │                        │  └──► PipelineCoordinator ──► Pipeline
//!        │                        ▼
//!        └─── Readiness ◄── PollTable + FdRouter ◄── poll(2)
//! ```
//!
//! A stream has a single listener: a second request for a stream that is
//! already running is answered with 404.

pub mod backend;
pub mod config;
pub mod error;
pub mod poll;
pub mod session;
pub mod stats;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use backend::{AudioPipe, Pipeline, Receiver};
pub use config::MuxConfig;
pub use error::{Error, Result};
pub use poll::{FdRouter, PollTable};
pub use session::{Disposition, HttpEvent, Multiplexer, Readiness, Session, Transport};
pub use stats::MuxStats;
pub use stream::{StreamName, StreamRegistry};

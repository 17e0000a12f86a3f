//! Session state machine
//!
//! Tracks one client request from arrival to connection close.
//!
//! ```text
//!   Init ──► Resolving ──► Streaming ──► Closed
//!     │          │                         ▲
//!     └──────────┴──► Rejected ────────────┘
//! ```

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::backend::Receiver;
use crate::error::Error;
use crate::stream::StreamName;

/// Unique session identifier
pub type SessionId = u64;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Request path captured, not yet checked
    Init,
    /// Path accepted for length, resolving the stream
    Resolving,
    /// Audio descriptor registered, forwarding bytes
    Streaming,
    /// Answered with 404, waiting for the transport to close
    Rejected,
    /// Connection closed, all resources released
    Closed,
}

/// Per-connection state
pub struct Session {
    /// Unique session ID
    pub id: SessionId,

    /// Current phase
    pub(crate) phase: SessionPhase,

    /// Raw request URL
    pub(crate) url: String,

    /// Stream being served (after validation)
    pub(crate) stream: Option<StreamName>,

    /// Receiver held running by this session
    pub(crate) receiver: Option<Arc<dyn Receiver>>,

    /// Audio descriptor registered in the poll table
    pub(crate) fd: Option<RawFd>,

    /// Why the request was refused
    pub(crate) rejection: Option<Error>,

    /// Audio read from the receiver but not yet accepted by the transport
    pub(crate) pending: Bytes,

    /// Audio bytes accepted by the transport
    pub(crate) bytes_forwarded: u64,

    /// Connection start time
    pub created_at: Instant,

    /// Time streaming started
    pub(crate) streaming_since: Option<Instant>,
}

impl Session {
    /// Create a new session
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            phase: SessionPhase::Init,
            url: String::new(),
            stream: None,
            receiver: None,
            fd: None,
            rejection: None,
            pending: Bytes::new(),
            bytes_forwarded: 0,
            created_at: Instant::now(),
            streaming_since: None,
        }
    }

    /// Capture a new request on this connection
    pub(crate) fn begin(&mut self, url: &str) {
        self.phase = SessionPhase::Init;
        self.url.clear();
        self.url.push_str(url);
        self.stream = None;
        self.rejection = None;
    }

    /// Move to the resolving phase
    pub(crate) fn resolving(&mut self, stream: StreamName) {
        self.phase = SessionPhase::Resolving;
        self.stream = Some(stream);
    }

    /// Move to the streaming phase holding `receiver` through `fd`
    pub(crate) fn streaming(&mut self, receiver: Arc<dyn Receiver>, fd: RawFd) {
        self.phase = SessionPhase::Streaming;
        self.receiver = Some(receiver);
        self.fd = Some(fd);
        self.streaming_since = Some(Instant::now());
    }

    /// Record a refused request
    pub(crate) fn reject(&mut self, reason: Error) {
        self.phase = SessionPhase::Rejected;
        self.rejection = Some(reason);
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Requested URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stream name, once validated
    pub fn stream(&self) -> Option<&StreamName> {
        self.stream.as_ref()
    }

    /// Audio descriptor, while streaming
    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    /// Why the request was refused, if it was
    pub fn rejection(&self) -> Option<&Error> {
        self.rejection.as_ref()
    }

    /// Audio bytes forwarded so far
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }

    /// Audio bytes waiting for the transport to accept them
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Check if the session is streaming
    pub fn is_streaming(&self) -> bool {
        self.phase == SessionPhase::Streaming
    }

    /// Check if the session is closed
    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// Time spent streaming
    pub fn streaming_duration(&self) -> Option<std::time::Duration> {
        self.streaming_since.map(|t| t.elapsed())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("url", &self.url)
            .field("stream", &self.stream)
            .field("fd", &self.fd)
            .field("pending", &self.pending.len())
            .field("bytes_forwarded", &self.bytes_forwarded)
            .finish()
    }
}

//! Event loop callbacks
//!
//! The HTTP engine reports everything that happens on a connection, and
//! every change it wants in the poll set, through one closed set of events.

use std::os::fd::RawFd;

use crate::poll::PollEvents;
use crate::session::SessionId;

/// Callback from the HTTP engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpEvent {
    /// A request line has been parsed
    NewRequest { path: String },
    /// The connection closed
    Closed,
    /// The connection can accept more body bytes
    Writable,
    /// A non-streaming response finished
    FileCompletion,
    /// The engine wants a socket watched
    AddPollFd { fd: RawFd, events: PollEvents },
    /// The engine no longer wants a socket watched
    DelPollFd { fd: RawFd },
    /// The engine changed a socket's watch mask
    ChangeModePollFd { fd: RawFd, events: PollEvents },
}

impl HttpEvent {
    /// Whether the event concerns a specific connection
    pub fn is_session_event(&self) -> bool {
        matches!(
            self,
            HttpEvent::NewRequest { .. }
                | HttpEvent::Closed
                | HttpEvent::Writable
                | HttpEvent::FileCompletion
        )
    }
}

/// What the HTTP engine should do with the connection after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the connection open
    Continue,
    /// Close the connection
    Close,
}

/// A descriptor reported ready by the last poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// An audio descriptor has data for this session; request a writable callback
    Audio(SessionId),
    /// A descriptor owned by the HTTP engine; let it service the events
    Transport { fd: RawFd, revents: PollEvents },
}

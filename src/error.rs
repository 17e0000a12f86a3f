//! Error types
//!
//! Every failure the multiplexer can report falls in one of three classes:
//! client errors (answered with 404 and otherwise ignored), I/O errors on an
//! audio descriptor (the session is closed), and internal faults (logged,
//! never allowed to touch other sessions' state).

use std::io;
use std::os::fd::RawFd;

use crate::stream::StreamName;

/// Result alias for multiplexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for multiplexer operations
#[derive(Debug)]
pub enum Error {
    /// Request path is not of the form `/streams/<id>.ogg`
    InvalidPath,
    /// Request path exceeds the configured maximum length
    UrlTooLong { len: usize, max: usize },
    /// No receiver registered under this name
    StreamNotFound(StreamName),
    /// Receiver exists but is not ready to produce audio
    StreamNotReady(StreamName),
    /// Receiver is already streaming to another session
    StreamBusy(StreamName),
    /// Receiver did not expose a readable descriptor
    MissingFd(StreamName),
    /// Poll table has no free slot
    PollTableFull { max_fds: usize },
    /// Descriptor is not in the poll table
    FdNotRegistered(RawFd),
    /// Descriptor value cannot be indexed (negative)
    InvalidFd(RawFd),
    /// Detach requested while no stream is active
    NoActiveStreams,
    /// I/O error on an audio descriptor or the transport
    Io(io::Error),
}

impl Error {
    /// Whether this error is answered with a 404 and otherwise has no effect
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPath
                | Error::UrlTooLong { .. }
                | Error::StreamNotFound(_)
                | Error::StreamNotReady(_)
                | Error::StreamBusy(_)
                | Error::MissingFd(_)
                | Error::PollTableFull { .. }
        )
    }

    /// Whether this error is a broken internal invariant
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Error::FdNotRegistered(_) | Error::InvalidFd(_) | Error::NoActiveStreams
        )
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::InvalidPath => Error::InvalidPath,
            Error::UrlTooLong { len, max } => Error::UrlTooLong {
                len: *len,
                max: *max,
            },
            Error::StreamNotFound(name) => Error::StreamNotFound(name.clone()),
            Error::StreamNotReady(name) => Error::StreamNotReady(name.clone()),
            Error::StreamBusy(name) => Error::StreamBusy(name.clone()),
            Error::MissingFd(name) => Error::MissingFd(name.clone()),
            Error::PollTableFull { max_fds } => Error::PollTableFull { max_fds: *max_fds },
            Error::FdNotRegistered(fd) => Error::FdNotRegistered(*fd),
            Error::InvalidFd(fd) => Error::InvalidFd(*fd),
            Error::NoActiveStreams => Error::NoActiveStreams,
            // io::Error is not Clone; keep kind and message
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidPath => write!(f, "Invalid stream path"),
            Error::UrlTooLong { len, max } => {
                write!(f, "Request URL too long: {} > {}", len, max)
            }
            Error::StreamNotFound(name) => write!(f, "Stream not found: {}", name),
            Error::StreamNotReady(name) => write!(f, "Stream not ready: {}", name),
            Error::StreamBusy(name) => write!(f, "Stream already running: {}", name),
            Error::MissingFd(name) => write!(f, "Stream has no readable descriptor: {}", name),
            Error::PollTableFull { max_fds } => write!(f, "Too many fds (max {})", max_fds),
            Error::FdNotRegistered(fd) => write!(f, "Descriptor not registered: {}", fd),
            Error::InvalidFd(fd) => write!(f, "Invalid descriptor: {}", fd),
            Error::NoActiveStreams => write!(f, "Detach with no active streams"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

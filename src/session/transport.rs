//! Transport collaborator
//!
//! The HTTP engine owning the client socket. The multiplexer only hands it
//! a status, a response head and body chunks, and re-arms its inactivity
//! timer; framing and socket I/O are the engine's business.

use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

/// HTTP 200
pub const STATUS_OK: u16 = 200;

/// HTTP 404
pub const STATUS_NOT_FOUND: u16 = 404;

/// Connection handle provided by the HTTP engine
pub trait Transport {
    /// Send a bodiless response with `status`
    fn respond_status(&mut self, status: u16);

    /// Send a response head
    fn write_head(&mut self, head: &ResponseHead) -> io::Result<()>;

    /// Send body bytes, returning how many were accepted
    ///
    /// Accepting fewer than `data.len()` is not an error; the caller keeps
    /// the rest and offers it again on the next writable callback.
    fn write_body(&mut self, data: Bytes) -> io::Result<usize>;

    /// Close the connection if nothing is written within `timeout`
    fn set_timeout(&mut self, timeout: Duration);

    /// Finish the current transaction; `true` means the connection must close
    fn transaction_completed(&mut self) -> bool;
}

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(&'static str, &'static str)>,
}

impl ResponseHead {
    /// Create a head with no headers
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// The head preceding a live Ogg stream
    pub fn audio_ogg() -> Self {
        Self::new(STATUS_OK)
            .header("Content-Type", "audio/ogg")
            .header("Expires", "0")
            .header("Pragma", "no-cache")
            .header("Cache-Control", "no-cache, no-store, must-revalidate")
    }

    /// Append a header
    pub fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Value of the first header called `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&'static str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// Render as an HTTP/1.1 header block
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(reason_phrase(self.status).as_bytes());
        buf.put_slice(b"\r\n");

        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");

        buf.freeze()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        STATUS_OK => "OK",
        STATUS_NOT_FOUND => "Not Found",
        _ => "",
    }
}

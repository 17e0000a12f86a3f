//! Signal-processing backend interface
//!
//! The DSP graph itself lives outside this crate. The multiplexer only sees
//! two things:
//!
//! - a [`Receiver`] per stream, which once started makes encoded audio
//!   readable on a descriptor
//! - the shared [`Pipeline`], which must be running for any receiver to
//!   produce data and runs its own worker thread
//!
//! The pipeline's lock is the only synchronisation point between that worker
//! thread and the event loop thread.

pub mod pipe;

use std::io;
use std::os::fd::RawFd;

pub use pipe::AudioPipe;

/// One demodulating audio source
pub trait Receiver: Send + Sync {
    /// Whether the receiver is configured and able to start
    fn is_ready(&self) -> bool;

    /// Whether the receiver is currently producing audio
    fn is_running(&self) -> bool;

    /// Start producing audio. Called with the pipeline lock held.
    fn start(&self);

    /// Stop producing audio. Called with the pipeline lock held.
    fn stop(&self);

    /// Readable descriptor carrying the encoded audio
    fn fd(&self) -> Option<RawFd>;
}

/// The shared processing graph all receivers hang off
pub trait Pipeline: Send + Sync {
    /// Acquire the lock shared with the pipeline's worker thread
    fn lock(&self);

    /// Release the lock taken by [`lock`](Self::lock)
    fn unlock(&self);

    /// Start the worker thread
    fn start(&self);

    /// Ask the worker thread to stop
    fn stop(&self);

    /// Block until the worker thread has fully stopped
    fn wait(&self);
}

/// Read once from a non-blocking descriptor
///
/// `EAGAIN` is reported as [`io::ErrorKind::WouldBlock`]; zero means the
/// writer closed its end.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid writable region of `buf.len()` bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

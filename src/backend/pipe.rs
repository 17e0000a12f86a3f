//! Pipe used by receivers to hand encoded audio to the event loop
//!
//! The DSP worker writes into the write end; the read end is non-blocking so
//! the event loop can drain whatever is available without stalling.

use std::io;
use std::os::fd::RawFd;

/// A pipe pair with a non-blocking read end
#[derive(Debug)]
pub struct AudioPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl AudioPipe {
    /// Create a new pipe
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];

        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };

        set_flag(pipe.read_fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
        set_flag(pipe.read_fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
        set_flag(pipe.write_fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;

        Ok(pipe)
    }

    /// The non-blocking read end
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// The write end, `-1` once closed
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Close the write end; the reader sees end of stream once drained
    pub fn close_write(&mut self) {
        if self.write_fd >= 0 {
            // SAFETY: the descriptor is owned by this pipe and forgotten below.
            unsafe { libc::close(self.write_fd) };
            self.write_fd = -1;
        }
    }

    /// Write all of `data` into the pipe
    pub fn write(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            // SAFETY: `data` is a valid readable region of `data.len()` bytes.
            let n = unsafe { libc::write(self.write_fd, data.as_ptr().cast(), data.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            data = &data[n as usize..];
        }
        Ok(())
    }
}

impl Drop for AudioPipe {
    fn drop(&mut self) {
        self.close_write();
        // SAFETY: the read end is owned by this pipe and closed only here.
        unsafe { libc::close(self.read_fd) };
    }
}

fn set_flag(fd: RawFd, get: libc::c_int, set: libc::c_int, flag: libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own with integer arguments only.
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, set, flags | flag) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

//! Dense poll set with O(1) descriptor lookup
//!
//! The entries are stored contiguously as `libc::pollfd` so the whole slice can
//! be handed to `poll(2)` on every event loop iteration. A reverse index maps
//! each descriptor value to its slot:
//!
//! ```text
//!   index[fd]  ──►  entries[slot]
//!
//!   entries: [ fd 5 | fd 9 | fd 7 | fd 12 ]      len = 4
//!   remove(9):        ▲               │
//!                     └───── last ────┘          swap last into slot 1
//!   entries: [ fd 5 | fd 12 | fd 7 ]             len = 3, index[12] = 1
//! ```
//!
//! Invariant: `entries[index[fd]].fd == fd` for every live descriptor.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::config::DEFAULT_FD_LIMIT;
use crate::error::{Error, Result};

/// Poll event mask (`POLLIN`, `POLLOUT`, ...)
pub type PollEvents = libc::c_short;

/// Bounded, densely packed poll set
pub struct PollTable {
    /// Live entries, always `entries.len() <= max_fds`
    entries: Vec<libc::pollfd>,

    /// Descriptor value to slot position, never longer than `fd_limit`
    index: Vec<Option<usize>>,

    max_fds: usize,
    fd_limit: usize,
}

impl PollTable {
    /// Create an empty table holding at most `max_fds` descriptors
    pub fn new(max_fds: usize) -> Self {
        Self::with_fd_limit(max_fds, DEFAULT_FD_LIMIT)
    }

    /// Create an empty table accepting only descriptors below `fd_limit`
    pub fn with_fd_limit(max_fds: usize, fd_limit: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_fds),
            index: Vec::new(),
            max_fds,
            fd_limit,
        }
    }

    /// Add a descriptor watching `events`
    ///
    /// Adding a descriptor that is already present only replaces its watch mask.
    pub fn add(&mut self, fd: RawFd, events: PollEvents) -> Result<()> {
        let key = index_key(fd, self.fd_limit)?;

        if let Some(slot) = self.position(fd) {
            self.entries[slot].events = events;
            return Ok(());
        }

        if self.entries.len() >= self.max_fds {
            tracing::warn!(fd = fd, max_fds = self.max_fds, "Too many fds");
            return Err(Error::PollTableFull {
                max_fds: self.max_fds,
            });
        }

        if key >= self.index.len() {
            self.index.resize(key + 1, None);
        }
        self.index[key] = Some(self.entries.len());
        self.entries.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });

        tracing::trace!(fd = fd, count = self.entries.len(), "Poll fd added");
        Ok(())
    }

    /// Remove a descriptor, moving the last entry into its slot
    ///
    /// Removing a descriptor that is not present leaves the table untouched.
    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let slot = self.position(fd).ok_or(Error::FdNotRegistered(fd))?;

        self.entries.swap_remove(slot);
        // Nothing moved when the removed entry was the last one
        if let Some(moved) = self.entries.get(slot) {
            self.index[moved.fd as usize] = Some(slot);
        }
        self.index[fd as usize] = None;

        tracing::trace!(fd = fd, count = self.entries.len(), "Poll fd removed");
        Ok(())
    }

    /// Mutable access to a descriptor's watch mask
    pub fn events_mut(&mut self, fd: RawFd) -> Option<&mut PollEvents> {
        let slot = self.position(fd)?;
        Some(&mut self.entries[slot].events)
    }

    /// Replace a descriptor's watch mask
    pub fn set_events(&mut self, fd: RawFd, events: PollEvents) -> Result<()> {
        let mask = self.events_mut(fd).ok_or(Error::FdNotRegistered(fd))?;
        *mask = events;
        Ok(())
    }

    /// Slot currently holding `fd`
    pub fn position(&self, fd: RawFd) -> Option<usize> {
        let key = usize::try_from(fd).ok()?;
        self.index.get(key).copied().flatten()
    }

    /// Check if a descriptor is present
    pub fn contains(&self, fd: RawFd) -> bool {
        self.position(fd).is_some()
    }

    /// Number of live descriptors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of descriptors
    pub fn capacity(&self) -> usize {
        self.max_fds
    }

    /// Check if no further descriptor can be added
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_fds
    }

    /// Live entries in slot order
    pub fn entries(&self) -> &[libc::pollfd] {
        &self.entries
    }

    /// Descriptors with pending events after the last [`wait`](Self::wait)
    pub fn ready(&self) -> impl Iterator<Item = (RawFd, PollEvents)> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.revents != 0)
            .map(|entry| (entry.fd, entry.revents))
    }

    /// Block in `poll(2)` until a descriptor is ready or `timeout` elapses
    ///
    /// `None` waits indefinitely. Returns the number of ready descriptors;
    /// an interrupted wait reports zero.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        for entry in &mut self.entries {
            entry.revents = 0;
        }

        // SAFETY: the pointer and length describe our own initialised slice,
        // which stays borrowed mutably for the duration of the call.
        let n = unsafe {
            libc::poll(
                self.entries.as_mut_ptr(),
                self.entries.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

impl std::fmt::Debug for PollTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollTable")
            .field("fds", &self.entries.iter().map(|e| e.fd).collect::<Vec<_>>())
            .field("max_fds", &self.max_fds)
            .field("fd_limit", &self.fd_limit)
            .finish()
    }
}

/// Slot in an fd-indexed lookup, refusing negative values and values at or
/// above `fd_limit`
pub(crate) fn index_key(fd: RawFd, fd_limit: usize) -> Result<usize> {
    match usize::try_from(fd) {
        Ok(key) if key < fd_limit => Ok(key),
        _ => Err(Error::InvalidFd(fd)),
    }
}

//! Descriptor to session routing
//!
//! When the poll set reports an audio descriptor readable, the event loop
//! needs the session that is streaming from it. The router is indexed by
//! descriptor value, like the poll table's reverse index.

use std::os::fd::RawFd;

use crate::config::DEFAULT_FD_LIMIT;
use crate::error::Result;
use crate::session::SessionId;

use super::table::index_key;

/// Maps active audio descriptors to the session consuming them
#[derive(Debug)]
pub struct FdRouter {
    routes: Vec<Option<SessionId>>,
    len: usize,
    fd_limit: usize,
}

impl Default for FdRouter {
    fn default() -> Self {
        Self::with_fd_limit(DEFAULT_FD_LIMIT)
    }
}

impl FdRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty router accepting only descriptors below `fd_limit`
    pub fn with_fd_limit(fd_limit: usize) -> Self {
        Self {
            routes: Vec::new(),
            len: 0,
            fd_limit,
        }
    }

    /// Route `fd` to `session`, replacing any previous owner
    pub fn bind(&mut self, fd: RawFd, session: SessionId) -> Result<Option<SessionId>> {
        let key = index_key(fd, self.fd_limit)?;
        if key >= self.routes.len() {
            self.routes.resize(key + 1, None);
        }

        let previous = self.routes[key].replace(session);
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    /// Drop the route for `fd`, returning its owner
    pub fn unbind(&mut self, fd: RawFd) -> Option<SessionId> {
        let key = usize::try_from(fd).ok()?;
        let previous = self.routes.get_mut(key)?.take();
        if previous.is_some() {
            self.len -= 1;
        }
        previous
    }

    /// Session currently consuming `fd`
    pub fn route(&self, fd: RawFd) -> Option<SessionId> {
        let key = usize::try_from(fd).ok()?;
        self.routes.get(key).copied().flatten()
    }

    /// Number of routed descriptors
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no descriptor is routed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

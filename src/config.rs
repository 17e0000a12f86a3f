//! Multiplexer configuration

use std::time::Duration;

/// Prefix every stream path must start with
pub const STREAMS_PREFIX: &str = "/streams/";

/// Suffix every stream path must end with
pub const OGG_SUFFIX: &str = ".ogg";

/// Length of the final path segment, `<id>.ogg`
pub const STREAM_NAME_LEN: usize = 12;

/// Length of the stream identifier without the suffix
pub const STREAM_ID_LEN: usize = STREAM_NAME_LEN - OGG_SUFFIX.len();

/// Default exclusive upper bound on descriptor values
pub const DEFAULT_FD_LIMIT: usize = 65536;

/// Multiplexer configuration options
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum number of descriptors in the poll set (sockets and audio pipes)
    pub max_fds: usize,

    /// Descriptor values must be below this; sizes the fd-indexed lookups
    pub fd_limit: usize,

    /// Maximum accepted request URL length
    pub max_url_len: usize,

    /// Bytes read from an audio descriptor per writable callback
    pub read_buffer_size: usize,

    /// Transport inactivity timeout, re-armed after each forwarded chunk
    pub inactivity_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_fds: 1024,
            fd_limit: DEFAULT_FD_LIMIT,
            max_url_len: 64,
            read_buffer_size: 4096,
            inactivity_timeout: Duration::from_secs(5),
        }
    }
}

impl MuxConfig {
    /// Set maximum poll set size
    pub fn max_fds(mut self, max: usize) -> Self {
        self.max_fds = max.max(1);
        self
    }

    /// Set the descriptor value ceiling
    pub fn fd_limit(mut self, limit: usize) -> Self {
        self.fd_limit = limit.max(1);
        self
    }

    /// Set maximum request URL length
    pub fn max_url_len(mut self, len: usize) -> Self {
        self.max_url_len = len;
        self
    }

    /// Set per-tick read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set inactivity timeout
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }
}

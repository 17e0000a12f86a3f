//! Multiplexer statistics

/// Counters for the whole multiplexer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Stream requests received
    pub requests: u64,
    /// Requests answered with 404
    pub rejected: u64,
    /// Streams whose response head was sent
    pub streams_started: u64,
    /// Streaming sessions that were closed
    pub streams_closed: u64,
    /// Audio bytes accepted by transports
    pub bytes_forwarded: u64,
    /// Internal invariant violations observed
    pub faults: u64,
    /// Streams currently attached to the pipeline
    pub active_streams: usize,
    /// Descriptors currently in the poll table
    pub open_fds: usize,
}

impl MuxStats {
    /// Create zeroed stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of requests rejected, 0 when there were none
    pub fn rejection_rate(&self) -> f64 {
        if self.requests > 0 {
            self.rejected as f64 / self.requests as f64
        } else {
            0.0
        }
    }
}

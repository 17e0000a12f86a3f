//! Shared pipeline coordination
//!
//! The pipeline must run exactly while at least one stream is active:
//!
//! ```text
//!   attach:  lock ─ receiver.start ─ unlock ─ (0→1) pipeline.start
//!   detach:  (1→0) pipeline.stop ─ pipeline.wait ─ lock ─ receiver.stop ─ unlock
//! ```
//!
//! The worker thread reads from every started receiver, so it has to be fully
//! stopped before the last receiver is torn down, and a receiver has to be
//! started before the worker so data is available immediately. Attach and
//! detach are only called from the event loop thread, so the active count
//! needs no atomics; the pipeline lock covers just the receiver calls.

use std::sync::Arc;

use crate::backend::{Pipeline, Receiver};
use crate::error::{Error, Result};

/// Reference-counts active streams and drives the shared pipeline
pub struct PipelineCoordinator {
    pipeline: Arc<dyn Pipeline>,
    active: usize,
}

impl PipelineCoordinator {
    /// Create a coordinator with no active streams
    pub fn new(pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            pipeline,
            active: 0,
        }
    }

    /// Start `receiver` and, if it is the first active stream, the pipeline
    pub fn attach(&mut self, receiver: &dyn Receiver) {
        {
            let _lock = PipelineLock::acquire(self.pipeline.as_ref());
            receiver.start();
        }

        self.active += 1;
        if self.active == 1 {
            tracing::info!("Starting pipeline");
            self.pipeline.start();
        }
    }

    /// Stop `receiver`, stopping the pipeline first if it is the last active stream
    pub fn detach(&mut self, receiver: &dyn Receiver) -> Result<()> {
        if self.active == 0 {
            tracing::error!("Detach requested with no active streams");
            return Err(Error::NoActiveStreams);
        }

        if self.active == 1 {
            tracing::info!("Stopping pipeline");
            self.pipeline.stop();
            self.pipeline.wait();
        }

        {
            let _lock = PipelineLock::acquire(self.pipeline.as_ref());
            receiver.stop();
        }

        self.active -= 1;
        Ok(())
    }

    /// Number of attached streams
    pub fn active_streams(&self) -> usize {
        self.active
    }

    /// Whether the pipeline should currently be running
    pub fn is_pipeline_running(&self) -> bool {
        self.active > 0
    }
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("active", &self.active)
            .finish()
    }
}

/// Holds the pipeline lock until dropped
struct PipelineLock<'a> {
    pipeline: &'a dyn Pipeline,
}

impl<'a> PipelineLock<'a> {
    fn acquire(pipeline: &'a dyn Pipeline) -> Self {
        pipeline.lock();
        Self { pipeline }
    }
}

impl Drop for PipelineLock<'_> {
    fn drop(&mut self) {
        self.pipeline.unlock();
    }
}

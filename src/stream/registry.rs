//! Stream registry
//!
//! Maps stream names to their backend receivers. Built once at startup;
//! request handling only reads from it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Receiver;
use crate::error::{Error, Result};

use super::name::StreamName;

/// Read-only lookup of receivers by stream name
pub struct StreamRegistry {
    receivers: HashMap<StreamName, Arc<dyn Receiver>>,
}

impl StreamRegistry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up the receiver backing `name`
    pub fn resolve(&self, name: &StreamName) -> Result<Arc<dyn Receiver>> {
        self.receivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StreamNotFound(name.clone()))
    }

    /// Check if a stream is registered
    pub fn contains(&self, name: &StreamName) -> bool {
        self.receivers.contains_key(name)
    }

    /// Registered stream names, sorted
    pub fn names(&self) -> Vec<&StreamName> {
        let mut names: Vec<_> = self.receivers.keys().collect();
        names.sort();
        names
    }

    /// Number of registered streams
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    /// Check if no stream is registered
    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Number of receivers currently running
    pub fn running_count(&self) -> usize {
        self.receivers.values().filter(|r| r.is_running()).count()
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.names())
            .finish()
    }
}

/// Builder for [`StreamRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    receivers: HashMap<StreamName, Arc<dyn Receiver>>,
}

impl RegistryBuilder {
    /// Register a receiver, replacing any previous one under the same name
    pub fn insert(mut self, name: StreamName, receiver: Arc<dyn Receiver>) -> Self {
        if self.receivers.insert(name.clone(), receiver).is_some() {
            tracing::warn!(stream = %name, "Receiver registered twice, keeping the last");
        }
        self
    }

    /// Finish building
    pub fn build(self) -> StreamRegistry {
        tracing::debug!(streams = self.receivers.len(), "Stream registry built");
        StreamRegistry {
            receivers: self.receivers,
        }
    }
}

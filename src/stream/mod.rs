//! Stream naming and lookup
//!
//! A stream is a named audio source backed by one receiver. Names are
//! validated from the request path, then resolved through the registry,
//! which is populated once at startup and only read afterwards.

pub mod name;
pub mod registry;

pub use name::{validate, StreamName};
pub use registry::{RegistryBuilder, StreamRegistry};

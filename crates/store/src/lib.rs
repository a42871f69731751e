//! Config store facade.
//!
//! Unified CRUD over the configuration entity collections with two
//! interchangeable backends: the embedded in-memory store (with AEAD
//! snapshot persistence) shipped here, or an external document store
//! supplied as another [`ConfigStore`] implementation. The facade never
//! caches — that is the cache layer's job.

pub mod collections;
mod error;
mod filter;
mod memory;
pub mod snapshot;
mod store;

pub use error::StoreError;
pub use filter::Filter;
pub use memory::MemoryConfigStore;
pub use snapshot::{SnapshotData, read_snapshot, write_snapshot};
pub use store::{ConfigStore, ConfigStoreExt};

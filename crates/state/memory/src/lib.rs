//! In-process [`SharedStore`] backed by a [`DashMap`].
//!
//! Safe only for single-worker deployments: counters and blacklists kept
//! here are invisible to other processes. The server refuses to start with
//! this backend when more than one worker is configured.

mod store;

pub use store::MemorySharedStore;

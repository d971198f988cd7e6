//! # sl-store
//!
//! Durable storage for Streamline: the [`BlobStore`] abstraction every worker
//! shares, a local-directory and an in-memory implementation, and the
//! [`BufferedPublisher`] through which all state transitions are committed.

mod blob;
mod publisher;

pub use blob::{object_key, BlobStore, LocalBlobStore, MemoryBlobStore, StoreResult};
pub use publisher::BufferedPublisher;

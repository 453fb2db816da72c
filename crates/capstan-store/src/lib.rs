//! Durable-store seams for Capstan.
//!
//! Every store is a trait with an in-memory backend (tests, single-node
//! deployments) and, for blobs, a filesystem backend. All coordination is
//! conditional writes on the store — no in-process locks guard the
//! durable path.

pub mod blob;
pub mod gc_queue;
pub mod manifest_store;
pub mod records;
pub mod retry;

pub use blob::{content_hash, verify_checksum, BlobStore, FsBlobStore, MemoryBlobStore};
pub use gc_queue::{GcDelivery, GcMessage, GcQueue, GcReason, MemoryGcQueue};
pub use manifest_store::{ManifestStore, MemoryManifestStore};
pub use records::{
    ExecutionStore, IdempotencyStore, MemoryExecutionStore, MemoryIdempotencyStore,
    MemoryTokenStore, TokenStore,
};
pub use retry::{with_backoff, RetryPolicy};

//! Retry queue for contexts awaiting redelivery.
//!
//! This crate provides:
//! - RetryQueue: bounded priority queue with backoff, dedup and an in-flight set
//! - BackoffPolicy: bounded exponential backoff with jitter
//! - DurableStore: keyed storage used by the persisted variant (memory and file backends)

mod backoff;
mod queue;
mod storage;

pub use backoff::BackoffPolicy;
pub use queue::{
    storage_key, PushResult, QueueItem, RejectReason, RetryEntry, RetryQueue, RetryQueueConfig,
};
pub use storage::{DurableStore, FileStore, MemoryStore, StorageError, StorageResult};

//! Durable, retryable queue that resolves remote references embedded in
//! posts and caches them on the owning post.

pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod resolver;
pub mod transport;

pub use backoff::Backoff;
pub use error::{FailurePolicy, FetchError, QueueStatusError, StoreError};
pub use model::{Cache, CacheItem, QueueEntry, QueueStatus, QueueType, Stream};
pub use pipeline::{CachePipeline, ItemOutcome};
pub use queue::{DiscardReason, EntryOutcome, QueueOptions, StreamQueue, SweepReport};

//! Typed errors for the queue and the fetch pipeline.
use thiserror::Error;

use crate::model::QueueStatus;

/// A status transition was attempted from the wrong state. Benign: another
/// worker owns or already finished the entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("queue entry {id} is not {expected}")]
pub struct QueueStatusError {
    pub id: i64,
    pub expected: &'static str,
}

impl QueueStatusError {
    pub fn new(id: i64, expected: QueueStatus) -> Self {
        Self {
            id,
            expected: expected.as_str(),
        }
    }
}

/// Failure of a guarded status transition.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Status(#[from] QueueStatusError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_status(&self) -> bool {
        matches!(self, StoreError::Status(_))
    }
}

/// What the scheduler does with a cache item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave the item pending; the entry completes as a failure and backs off.
    Retry,
    /// Mark the item as dropped; it is never fetched again.
    Drop,
    /// Leave the item untouched without logging.
    Ignore,
    /// Not part of the taxonomy; abort the entry and surface the error.
    Escalate,
}

/// Every way resolving one cache item can fail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("post {0} not found after save")]
    PostNotFound(String),
    #[error("object id {found} does not match requested {expected}")]
    InvalidOrigin { expected: String, found: String },
    #[error("expected a Note, got {0}")]
    InvalidResource(String),
    #[error("remote refused the request ({status})")]
    RequestContent { status: u16 },
    #[error("network error: {0}")]
    RequestNetwork(String),
    #[error("response is not json: {0}")]
    RequestResultNotJson(String),
    #[error("response exceeds {limit} bytes")]
    RequestResultSize { limit: u64 },
    #[error("remote server error ({status})")]
    RequestServer { status: u16 },
    #[error("malformed object: {0}")]
    MalformedStructure(String),
    #[error("unknown object kind {0}")]
    ItemUnknown(String),
    #[error("object nesting exceeds {limit}")]
    RedundancyLimit { limit: usize },
    #[error("configuration error: {0}")]
    AppConfig(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl FetchError {
    pub fn policy(&self) -> FailurePolicy {
        match self {
            FetchError::PostNotFound(_)
            | FetchError::RequestContent { .. }
            | FetchError::RequestNetwork(_)
            | FetchError::RequestResultNotJson(_)
            | FetchError::RequestServer { .. } => FailurePolicy::Retry,
            FetchError::InvalidOrigin { .. }
            | FetchError::InvalidResource(_)
            | FetchError::RequestResultSize { .. }
            | FetchError::MalformedStructure(_)
            | FetchError::ItemUnknown(_)
            | FetchError::RedundancyLimit { .. } => FailurePolicy::Drop,
            FetchError::AppConfig(_) => FailurePolicy::Ignore,
            FetchError::Unexpected(_) => FailurePolicy::Escalate,
        }
    }

    /// Malformed structures and configuration problems are not logged.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            FetchError::MalformedStructure(_) | FetchError::AppConfig(_)
        )
    }

    /// Stable name recorded on dropped cache items.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::PostNotFound(_) => "post_not_found",
            FetchError::InvalidOrigin { .. } => "invalid_origin",
            FetchError::InvalidResource(_) => "invalid_resource",
            FetchError::RequestContent { .. } => "request_content",
            FetchError::RequestNetwork(_) => "request_network",
            FetchError::RequestResultNotJson(_) => "request_result_not_json",
            FetchError::RequestResultSize { .. } => "request_result_size",
            FetchError::RequestServer { .. } => "request_server",
            FetchError::MalformedStructure(_) => "malformed_structure",
            FetchError::ItemUnknown(_) => "item_unknown",
            FetchError::RedundancyLimit { .. } => "redundancy_limit",
            FetchError::AppConfig(_) => "app_config",
            FetchError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<sqlx::Error> for FetchError {
    fn from(err: sqlx::Error) -> Self {
        FetchError::Unexpected(err.to_string())
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        FetchError::Unexpected(format!("{err:#}"))
    }
}

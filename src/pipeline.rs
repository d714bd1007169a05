//! Resolves one cache item: fetch, verify, store, and serialize the reloaded post.
use chrono::Utc;
use reqwest::Url;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use crate::db::{self, Pool};
use crate::error::{FailurePolicy, FetchError};
use crate::model::{CacheItem, OriginSource};
use crate::resolver::{ObjectResolver, NOTE};
use crate::transport::Transport;

/// Result of one attempt at a cache item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Resolved,
    /// Item was not pending; nothing fetched.
    Skipped,
    Failed(FetchError),
}

impl ItemOutcome {
    /// True when the owning queue entry should complete as a failure.
    pub fn needs_retry(&self) -> bool {
        match self {
            ItemOutcome::Failed(err) => err.policy() != FailurePolicy::Drop,
            _ => false,
        }
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self, ItemOutcome::Failed(err) if err.policy() == FailurePolicy::Escalate)
    }
}

/// Fetch, validate, store and record one remote reference.
#[derive(Clone)]
pub struct CachePipeline {
    pool: Pool,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn ObjectResolver>,
}

impl CachePipeline {
    pub fn new(pool: Pool, transport: Arc<dyn Transport>, resolver: Arc<dyn ObjectResolver>) -> Self {
        Self {
            pool,
            transport,
            resolver,
        }
    }

    /// Consumes the item and hands it back updated: `content` on success,
    /// `error` when the failure drops it for good, untouched otherwise.
    #[instrument(skip_all, fields(url = %item.url))]
    pub async fn cache_item(&self, mut item: CacheItem) -> (CacheItem, ItemOutcome) {
        if !item.is_pending() {
            return (item, ItemOutcome::Skipped);
        }

        match self.resolve(&item.url).await {
            Ok(content) => {
                debug!("cache item resolved");
                item.content = Some(content);
                (item, ItemOutcome::Resolved)
            }
            Err(err) => {
                let policy = err.policy();
                if policy == FailurePolicy::Escalate {
                    error!(error = %err, "unexpected error caching stream");
                } else if !err.is_silent() {
                    warn!(error = %err, kind = err.kind(), ?policy, "error caching stream");
                }
                if policy == FailurePolicy::Drop {
                    item.error = Some(err.kind().to_string());
                }
                (item, ItemOutcome::Failed(err))
            }
        }
    }

    async fn resolve(&self, url: &str) -> Result<String, FetchError> {
        let data = self.transport.fetch(url).await?;
        let mut object = self.resolver.parse(&data)?;

        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::MalformedStructure(format!("no host in {url}")))?;
        object.set_origin(host, OriginSource::Request, Utc::now().timestamp());

        if object.id != url {
            return Err(FetchError::InvalidOrigin {
                expected: url.to_string(),
                found: object.id,
            });
        }
        if object.kind != NOTE {
            return Err(FetchError::InvalidResource(object.kind));
        }

        let interface = self.resolver.interface_for(&object)?;
        interface.save(&object).await?;

        let note = db::get_stream_by_id(&self.pool, &object.id)
            .await?
            .ok_or_else(|| FetchError::PostNotFound(object.id.clone()))?;
        note.to_cache_json()
            .map_err(|e| FetchError::Unexpected(e.to_string()))
    }
}

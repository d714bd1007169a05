//! Queue scheduler: picks due entries, claims them, runs the cache pipeline
//! and records the outcome.
use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::StoreError;
use crate::model::{QueueEntry, QueueType};
use crate::pipeline::{CachePipeline, ItemOutcome};
use crate::resolver::ActivityResolver;
use crate::transport::HttpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub running_lease_secs: u64,
    pub success_retention_secs: u64,
    pub item_concurrency: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            running_lease_secs: 900,
            success_retention_secs: 86_400,
            item_concurrency: 1,
        }
    }
}

impl QueueOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            running_lease_secs: cfg.app.running_lease_seconds,
            success_retention_secs: cfg.app.success_retention_seconds,
            item_concurrency: cfg.app.item_concurrency.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    UnknownType,
    StreamNotFound,
    NothingPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Another worker holds the entry, or it is not on standby.
    Skipped,
    Discarded(DiscardReason),
    Completed {
        success: bool,
        resolved: usize,
        dropped: usize,
        pending: usize,
    },
    /// Processing failed unexpectedly; the entry was completed as a failure.
    Aborted(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub rearmed: u64,
    pub purged: u64,
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub discarded: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &EntryOutcome) {
        match outcome {
            EntryOutcome::Skipped => self.skipped += 1,
            EntryOutcome::Discarded(_) => self.discarded += 1,
            EntryOutcome::Completed { success: true, .. } => self.succeeded += 1,
            EntryOutcome::Completed { success: false, .. } => self.failed += 1,
            EntryOutcome::Aborted(_) => self.errors += 1,
        }
    }
}

pub struct StreamQueue {
    pool: Pool,
    pipeline: CachePipeline,
    backoff: Backoff,
    options: QueueOptions,
}

impl StreamQueue {
    pub fn new(pool: Pool, pipeline: CachePipeline, backoff: Backoff, options: QueueOptions) -> Self {
        Self {
            pool,
            pipeline,
            backoff,
            options,
        }
    }

    /// Queue wired to the HTTP transport and the activity resolver.
    pub fn from_config(pool: Pool, cfg: &Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::from_config(cfg)?);
        let resolver = Arc::new(ActivityResolver::from_config(pool.clone(), cfg));
        let pipeline = CachePipeline::new(pool.clone(), transport, resolver);
        Ok(Self::new(
            pool,
            pipeline,
            Backoff::new(cfg.app.max_backoff_seconds),
            QueueOptions::from_config(cfg),
        ))
    }

    /// Fresh grouping token for the entries of one triggering event.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[instrument(skip_all)]
    pub async fn enqueue(&self, token: &str, kind: &str, stream_id: &str) -> Result<QueueEntry> {
        let entry = db::create_queue_entry(&self.pool, token, kind, stream_id).await?;
        debug!(id = entry.id, token, kind, stream_id, "queue entry created");
        Ok(entry)
    }

    pub async fn list_due_entries(&self) -> Result<Vec<QueueEntry>> {
        self.list_due_entries_at(Utc::now().timestamp()).await
    }

    /// Standby entries whose backoff delay has elapsed at `now`.
    pub async fn list_due_entries_at(&self, now: i64) -> Result<Vec<QueueEntry>> {
        let standby = db::list_standby(&self.pool).await?;
        let total = standby.len();
        let due: Vec<QueueEntry> = standby
            .into_iter()
            .filter(|e| self.backoff.is_due(e, now))
            .collect();
        debug!(total, due = due.len(), "standby entries");
        Ok(due)
    }

    /// Processes every entry of `token`, ignoring backoff. An entry failing
    /// unexpectedly is reported as [`EntryOutcome::Aborted`] and the rest
    /// still run.
    #[instrument(skip_all)]
    pub async fn process_by_token(&self, token: &str) -> Result<Vec<EntryOutcome>> {
        info!(token, "processing queue by token");
        let entries = db::list_by_token(&self.pool, token).await?;
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in &entries {
            outcomes.push(self.process_or_abort(entry).await);
        }
        Ok(outcomes)
    }

    async fn process_or_abort(&self, entry: &QueueEntry) -> EntryOutcome {
        match self.process_entry(entry).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(?err, id = entry.id, "queue entry failed unexpectedly");
                EntryOutcome::Aborted(format!("{err:#}"))
            }
        }
    }

    /// Claims the entry and dispatches it on its type. If processing fails
    /// unexpectedly the entry is completed as a failure and the error returned.
    #[instrument(skip_all, fields(id = entry.id, kind = %entry.kind))]
    pub async fn process_entry(&self, entry: &QueueEntry) -> Result<EntryOutcome> {
        let claimed_at = match self.begin_attempt(entry).await {
            Ok(claimed_at) => claimed_at,
            Err(StoreError::Status(err)) => {
                debug!(%err, "entry already claimed; skipping");
                return Ok(EntryOutcome::Skipped);
            }
            Err(StoreError::Db(err)) => return Err(err.into()),
        };

        let result = match entry.queue_type() {
            QueueType::Cache => self.manage_cache_entry(entry, claimed_at).await,
            QueueType::Unknown(kind) => {
                warn!(kind = %kind, "unknown queue type; discarding");
                self.discard_entry(entry)
                    .await
                    .map(|_| EntryOutcome::Discarded(DiscardReason::UnknownType))
            }
        };

        if result.is_err() {
            if let Err(err) = self.complete_attempt(entry, claimed_at, false).await {
                error!(?err, "failed to record entry failure");
            }
        }
        result
    }

    async fn manage_cache_entry(&self, entry: &QueueEntry, claimed_at: i64) -> Result<EntryOutcome> {
        let Some(post) = db::get_stream_by_id(&self.pool, &entry.stream_id).await? else {
            info!(stream_id = %entry.stream_id, "stream not found; discarding entry");
            self.discard_entry(entry).await?;
            return Ok(EntryOutcome::Discarded(DiscardReason::StreamNotFound));
        };
        if !post.has_pending_cache() {
            self.discard_entry(entry).await?;
            return Ok(EntryOutcome::Discarded(DiscardReason::NothingPending));
        }

        let mut cache = post.cache;
        let mut results = stream::iter(cache.pending_items())
            .map(|item| self.pipeline.cache_item(item))
            .buffered(self.options.item_concurrency);

        let (mut resolved, mut dropped, mut pending) = (0, 0, 0);
        let mut escalated = None;
        while let Some((item, outcome)) = results.next().await {
            match &outcome {
                ItemOutcome::Resolved => resolved += 1,
                ItemOutcome::Skipped => {}
                ItemOutcome::Failed(_) if outcome.needs_retry() => pending += 1,
                ItemOutcome::Failed(_) => dropped += 1,
            }
            cache.update_item(item);
            if outcome.is_escalated() {
                escalated = Some(outcome);
                break;
            }
        }
        drop(results);

        db::update_cache(&self.pool, &entry.stream_id, &cache).await?;

        if let Some(ItemOutcome::Failed(err)) = escalated {
            return Err(anyhow!(err).context(format!("queue entry {} aborted", entry.id)));
        }

        let success = pending == 0;
        self.complete_attempt(entry, claimed_at, success).await?;
        info!(resolved, dropped, pending, success, "cache entry processed");
        Ok(EntryOutcome::Completed {
            success,
            resolved,
            dropped,
            pending,
        })
    }

    /// Standby -> Running, returning the claim stamp. A status error means
    /// another worker owns the entry.
    pub async fn begin_attempt(&self, entry: &QueueEntry) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        db::set_as_running(&self.pool, entry.id, now).await?;
        Ok(now)
    }

    /// Running -> Success/Failure for the claim stamped `claimed_at`. Stale
    /// completions (already finished or reclaimed) are ignored.
    pub async fn complete_attempt(
        &self,
        entry: &QueueEntry,
        claimed_at: i64,
        success: bool,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let res = if success {
            db::set_as_success(&self.pool, entry.id, claimed_at, now).await
        } else {
            db::set_as_failure(&self.pool, entry.id, claimed_at, now).await
        };
        match res {
            Ok(()) => Ok(()),
            Err(StoreError::Status(err)) => {
                debug!(%err, "stale completion ignored");
                Ok(())
            }
            Err(StoreError::Db(err)) => Err(err.into()),
        }
    }

    pub async fn discard_entry(&self, entry: &QueueEntry) -> Result<()> {
        db::delete_queue_entry(&self.pool, entry.id).await
    }

    pub async fn run_sweep(&self) -> Result<SweepReport> {
        self.run_sweep_at(Utc::now().timestamp()).await
    }

    /// One pass: housekeeping, then every due entry. An entry failing
    /// unexpectedly is logged and counted; the sweep moves on.
    #[instrument(skip_all)]
    pub async fn run_sweep_at(&self, now: i64) -> Result<SweepReport> {
        let mut report = SweepReport {
            reclaimed: db::reclaim_stale_running(&self.pool, self.options.running_lease_secs, now)
                .await?,
            rearmed: db::rearm_failures(&self.pool).await?,
            ..Default::default()
        };
        let retention = i64::try_from(self.options.success_retention_secs).unwrap_or(i64::MAX);
        report.purged = db::purge_succeeded(&self.pool, now.saturating_sub(retention)).await?;

        let due = self.list_due_entries_at(now).await?;
        report.due = due.len();
        for entry in &due {
            let outcome = self.process_or_abort(entry).await;
            report.record(&outcome);
        }
        if report.reclaimed > 0 {
            warn!(reclaimed = report.reclaimed, "reclaimed stale running entries");
        }
        Ok(report)
    }

    /// Sweeps every `poll_interval` until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run_forever(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_sweep().await {
                Ok(report) if report.due > 0 => info!(?report, "queue sweep finished"),
                Ok(_) => {}
                Err(err) => error!(?err, "queue sweep failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("queue worker stopped");
    }
}

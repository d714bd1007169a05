use super::model::{queue_entry_from_row, stream_from_row, StatusCounts};
use crate::error::{QueueStatusError, StoreError};
use crate::model::{Cache, QueueEntry, QueueStatus, Stream};
use anyhow::{anyhow, Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

const QUEUE_COLUMNS: &str = "id, token, type, stream_id, status, tries, last";
const STREAM_COLUMNS: &str = "id, type, attributed_to, content, published, object, origin_host, origin_source, origin_at, cache";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open {}", normalized))?;
    // WAL lets concurrent sweeps read while one claims an entry.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/`, make sure the parent
/// directory exists and add `mode=rwc` so the file is created on first use.
/// In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queue store
// ---------------------------------------------------------------------------

/// Inserts a standby entry. Duplicates of token/type/stream_id are allowed.
#[instrument(skip_all)]
pub async fn create_queue_entry(
    pool: &Pool,
    token: &str,
    kind: &str,
    stream_id: &str,
) -> Result<QueueEntry> {
    let row = sqlx::query(&format!(
        "INSERT INTO stream_queue (token, type, stream_id, status, tries, last) VALUES (?, ?, ?, ?, 0, 0) RETURNING {}",
        QUEUE_COLUMNS
    ))
    .bind(token)
    .bind(kind)
    .bind(stream_id)
    .bind(QueueStatus::Standby.as_str())
    .fetch_one(pool)
    .await?;
    queue_entry_from_row(&row)
}

#[instrument(skip_all)]
pub async fn get_queue_entry(pool: &Pool, id: i64) -> Result<Option<QueueEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM stream_queue WHERE id = ?",
        QUEUE_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_entry_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_standby(pool: &Pool) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM stream_queue WHERE status = ? ORDER BY id ASC",
        QUEUE_COLUMNS
    ))
    .bind(QueueStatus::Standby.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(queue_entry_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_by_token(pool: &Pool, token: &str) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM stream_queue WHERE token = ? ORDER BY id ASC",
        QUEUE_COLUMNS
    ))
    .bind(token)
    .fetch_all(pool)
    .await?;
    rows.iter().map(queue_entry_from_row).collect()
}

/// Conditional status update; the row only moves if it is still in `from`
/// and, when `claimed_at` is given, still carries that claim stamp.
async fn transition(
    pool: &Pool,
    id: i64,
    from: QueueStatus,
    to: QueueStatus,
    claimed_at: Option<i64>,
    now: i64,
) -> Result<(), StoreError> {
    let res = match claimed_at {
        None => {
            sqlx::query("UPDATE stream_queue SET status = ?, last = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(now)
                .bind(id)
                .bind(from.as_str())
                .execute(pool)
                .await?
        }
        Some(claimed_at) => {
            sqlx::query(
                "UPDATE stream_queue SET status = ?, tries = tries + 1, last = ? WHERE id = ? AND status = ? AND last = ?",
            )
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .bind(claimed_at)
            .execute(pool)
            .await?
        }
    };
    if res.rows_affected() == 0 {
        return Err(QueueStatusError::new(id, from).into());
    }
    Ok(())
}

/// Standby -> Running. Stamps `last` with the claim time; the caller keeps
/// `now` as its claim stamp for the completion.
#[instrument(skip_all)]
pub async fn set_as_running(pool: &Pool, id: i64, now: i64) -> Result<(), StoreError> {
    transition(pool, id, QueueStatus::Standby, QueueStatus::Running, None, now).await
}

/// Running -> Success, counting the attempt. Fails if the claim stamped at
/// `claimed_at` was reclaimed in the meantime.
#[instrument(skip_all)]
pub async fn set_as_success(
    pool: &Pool,
    id: i64,
    claimed_at: i64,
    now: i64,
) -> Result<(), StoreError> {
    transition(
        pool,
        id,
        QueueStatus::Running,
        QueueStatus::Success,
        Some(claimed_at),
        now,
    )
    .await
}

/// Running -> Failure, counting the attempt. Same claim check as
/// [`set_as_success`].
#[instrument(skip_all)]
pub async fn set_as_failure(
    pool: &Pool,
    id: i64,
    claimed_at: i64,
    now: i64,
) -> Result<(), StoreError> {
    transition(
        pool,
        id,
        QueueStatus::Running,
        QueueStatus::Failure,
        Some(claimed_at),
        now,
    )
    .await
}

#[instrument(skip_all)]
pub async fn delete_queue_entry(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM stream_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Failure -> Standby for every failed entry. `tries`/`last` are kept so the
/// backoff applies to the next attempt.
#[instrument(skip_all)]
pub async fn rearm_failures(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE stream_queue SET status = ? WHERE status = ?")
        .bind(QueueStatus::Standby.as_str())
        .bind(QueueStatus::Failure.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Running -> Standby for claims older than `lease_secs` (crashed workers).
#[instrument(skip_all)]
pub async fn reclaim_stale_running(pool: &Pool, lease_secs: u64, now: i64) -> Result<u64> {
    let cutoff = now.saturating_sub(i64::try_from(lease_secs).unwrap_or(i64::MAX));
    let res = sqlx::query("UPDATE stream_queue SET status = ? WHERE status = ? AND last < ?")
        .bind(QueueStatus::Standby.as_str())
        .bind(QueueStatus::Running.as_str())
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Deletes successful entries whose last attempt is at or before `cutoff`.
#[instrument(skip_all)]
pub async fn purge_succeeded(pool: &Pool, cutoff: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM stream_queue WHERE status = ? AND last <= ?")
        .bind(QueueStatus::Success.as_str())
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_by_status(pool: &Pool) -> Result<StatusCounts> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM stream_queue GROUP BY status")
        .fetch_all(pool)
        .await?;
    let mut counts = StatusCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        let status = QueueStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("unknown queue status {}", status))?;
        counts.add(status, n);
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

fn encode_cache(cache: &Cache) -> Result<Option<String>> {
    if cache.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        serde_json::to_string(cache).context("failed to encode cache")?,
    ))
}

/// Insert or refresh a post keyed by id. An existing cache column is only
/// replaced when the incoming stream carries cache items of its own.
#[instrument(skip_all)]
pub async fn upsert_stream(pool: &Pool, stream: &Stream) -> Result<()> {
    let object = serde_json::to_string(&stream.object).context("failed to encode object")?;
    let cache = encode_cache(&stream.cache)?;
    let origin = stream.origin.as_ref();
    sqlx::query(
        "INSERT INTO streams (id, type, attributed_to, content, published, object, origin_host, origin_source, origin_at, cache) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
            type = excluded.type, \
            attributed_to = excluded.attributed_to, \
            content = excluded.content, \
            published = excluded.published, \
            object = excluded.object, \
            origin_host = excluded.origin_host, \
            origin_source = excluded.origin_source, \
            origin_at = excluded.origin_at, \
            cache = COALESCE(excluded.cache, streams.cache), \
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(&stream.id)
    .bind(&stream.kind)
    .bind(stream.attributed_to.as_deref())
    .bind(stream.content.as_deref())
    .bind(stream.published.as_deref())
    .bind(object)
    .bind(origin.map(|o| o.host.as_str()))
    .bind(origin.map(|o| o.source.as_str()))
    .bind(origin.map(|o| o.at))
    .bind(cache)
    .execute(pool)
    .await
    .with_context(|| format!("failed to save stream {}", stream.id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_stream_by_id(pool: &Pool, id: &str) -> Result<Option<Stream>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM streams WHERE id = ?",
        STREAM_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(stream_from_row).transpose()
}

/// Writes the whole cache collection of a post back.
#[instrument(skip_all)]
pub async fn update_cache(pool: &Pool, stream_id: &str, cache: &Cache) -> Result<()> {
    let encoded = encode_cache(cache)?;
    let res = sqlx::query(
        "UPDATE streams SET cache = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(encoded)
    .bind(stream_id)
    .execute(pool)
    .await
    .context("failed to persist stream cache")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("stream {} not found", stream_id));
    }
    Ok(())
}

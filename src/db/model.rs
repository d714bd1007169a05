//! Row mapping for the queue and streams tables.
//!
//! Keep conversions here; business rules live in `queue` and `pipeline`.

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::model::{Cache, Origin, OriginSource, QueueEntry, QueueStatus, Stream};

/// Number of queue entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub standby: i64,
    pub running: i64,
    pub success: i64,
    pub failure: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.standby + self.running + self.success + self.failure
    }

    pub(crate) fn add(&mut self, status: QueueStatus, n: i64) {
        match status {
            QueueStatus::Standby => self.standby += n,
            QueueStatus::Running => self.running += n,
            QueueStatus::Success => self.success += n,
            QueueStatus::Failure => self.failure += n,
        }
    }
}

pub(crate) fn queue_entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = QueueStatus::parse_state(&status_str)
        .ok_or_else(|| anyhow!("queue entry {} has unknown status {}", id, status_str))?;
    let tries: i64 = row.get("tries");
    Ok(QueueEntry {
        id,
        token: row.get("token"),
        kind: row.get("type"),
        stream_id: row.get("stream_id"),
        status,
        tries: u32::try_from(tries).unwrap_or(u32::MAX),
        last: row.get("last"),
    })
}

pub(crate) fn stream_from_row(row: &SqliteRow) -> Result<Stream> {
    let id: String = row.get("id");
    let object: String = row.get("object");
    let object = serde_json::from_str(&object)
        .with_context(|| format!("stream {} has invalid object json", id))?;

    let cache = match row.try_get::<Option<String>, _>("cache").ok().flatten() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str::<Cache>(&raw)
            .with_context(|| format!("stream {} has invalid cache json", id))?,
        _ => Cache::default(),
    };

    let origin_host: Option<String> = row.try_get("origin_host").ok().flatten();
    let origin_source = row
        .try_get::<Option<String>, _>("origin_source")
        .ok()
        .flatten()
        .and_then(|s| OriginSource::parse_source(&s));
    let origin_at: Option<i64> = row.try_get("origin_at").ok().flatten();
    let origin = match (origin_host, origin_source, origin_at) {
        (Some(host), Some(source), Some(at)) => Some(Origin { host, source, at }),
        _ => None,
    };

    Ok(Stream {
        id,
        kind: row.get("type"),
        attributed_to: row.try_get("attributed_to").ok().flatten(),
        content: row.try_get("content").ok().flatten(),
        published: row.try_get("published").ok().flatten(),
        object,
        origin,
        cache,
    })
}

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Lifecycle state of a queue entry attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QueueStatus {
    Standby,
    Running,
    Success,
    Failure,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Standby => "standby",
            QueueStatus::Running => "running",
            QueueStatus::Success => "success",
            QueueStatus::Failure => "failure",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "standby" => Some(QueueStatus::Standby),
            "running" => Some(QueueStatus::Running),
            "success" => Some(QueueStatus::Success),
            "failure" => Some(QueueStatus::Failure),
            _ => None,
        }
    }
}

/// Handler selector stored in the `type` column. Unknown tags are kept
/// verbatim so they can be logged before the entry is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueType {
    Cache,
    Unknown(String),
}

impl QueueType {
    pub const CACHE: &'static str = "Cache";

    pub fn parse(s: &str) -> Self {
        match s {
            Self::CACHE => QueueType::Cache,
            other => QueueType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            QueueType::Cache => Self::CACHE,
            QueueType::Unknown(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub token: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub stream_id: String,
    pub status: QueueStatus,
    pub tries: u32,
    /// Unix seconds of the most recent attempt (0 if never attempted).
    pub last: i64,
}

impl QueueEntry {
    pub fn queue_type(&self) -> QueueType {
        QueueType::parse(&self.kind)
    }
}

/// How an object's origin was established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OriginSource {
    Header,
    Signature,
    Request,
}

impl OriginSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginSource::Header => "header",
            OriginSource::Signature => "signature",
            OriginSource::Request => "request",
        }
    }

    pub fn parse_source(s: &str) -> Option<Self> {
        match s {
            "header" => Some(OriginSource::Header),
            "signature" => Some(OriginSource::Signature),
            "request" => Some(OriginSource::Request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub source: OriginSource,
    pub at: i64,
}

/// One remote reference inside a post's cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheItem {
    pub url: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Failure kind recorded when the reference was dropped for good.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl CacheItem {
    pub fn new(url: impl Into<String>, created_at: i64) -> Self {
        Self {
            url: url.into(),
            content: None,
            error: None,
            created_at,
        }
    }

    /// Still waiting for a successful fetch: neither resolved nor dropped.
    pub fn is_pending(&self) -> bool {
        self.content.is_none() && self.error.is_none()
    }
}

/// Ordered cache collection owned by a post. Urls are unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    #[serde(default, deserialize_with = "deserialize_items")]
    items: Vec<CacheItem>,
}

/// Collapses repeated urls into the first slot, preferring a settled item
/// over a pending one.
fn dedupe_by_url(items: Vec<CacheItem>) -> Vec<CacheItem> {
    let mut out: Vec<CacheItem> = Vec::with_capacity(items.len());
    for item in items {
        match out.iter_mut().find(|i| i.url == item.url) {
            Some(slot) => {
                if slot.is_pending() && !item.is_pending() {
                    *slot = item;
                }
            }
            None => out.push(item),
        }
    }
    out
}

fn deserialize_items<'de, D>(deserializer: D) -> Result<Vec<CacheItem>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<CacheItem>::deserialize(deserializer).map(dedupe_by_url)
}

impl Cache {
    pub fn new(items: Vec<CacheItem>) -> Self {
        Self {
            items: dedupe_by_url(items),
        }
    }

    pub fn items(&self) -> &[CacheItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends a reference unless the url is already tracked.
    pub fn add_item(&mut self, item: CacheItem) {
        if self.items.iter().all(|i| i.url != item.url) {
            self.items.push(item);
        }
    }

    /// Replaces the item with the same url. Returns false if none matched.
    pub fn update_item(&mut self, item: CacheItem) -> bool {
        match self.items.iter_mut().find(|i| i.url == item.url) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    pub fn pending_items(&self) -> Vec<CacheItem> {
        self.items
            .iter()
            .filter(|i| i.is_pending())
            .cloned()
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.items.iter().any(CacheItem::is_pending)
    }
}

/// A locally stored post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "attributedTo", skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    pub object: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default, skip_serializing_if = "Cache::is_empty")]
    pub cache: Cache,
}

impl Stream {
    pub fn has_pending_cache(&self) -> bool {
        self.cache.has_pending()
    }

    /// JSON form stored into a referencing post's cache item.
    pub fn to_cache_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

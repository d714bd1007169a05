//! Parses fetched payloads into remote objects and saves them through the
//! interface registered for their kind.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use reqwest::Url;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::FetchError;
use crate::model::{Cache, Origin, OriginSource, Stream};

pub const NOTE: &str = "Note";

/// Kinds the parser understands. Anything else is `ItemUnknown`.
const KNOWN_KINDS: &[&str] = &[
    "Note",
    "Article",
    "Question",
    "Document",
    "Image",
    "Tombstone",
    "Person",
    "Service",
    "Group",
    "Application",
    "Create",
    "Update",
    "Delete",
    "Announce",
    "Like",
    "Follow",
    "Undo",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub id: String,
    pub kind: String,
    pub attributed_to: Option<String>,
    pub content: Option<String>,
    pub published: Option<String>,
    pub payload: Value,
    pub origin: Option<Origin>,
}

impl RemoteObject {
    pub fn set_origin(&mut self, host: impl Into<String>, source: OriginSource, at: i64) {
        self.origin = Some(Origin {
            host: host.into(),
            source,
            at,
        });
    }

    pub fn to_stream(&self) -> Stream {
        Stream {
            id: self.id.clone(),
            kind: self.kind.clone(),
            attributed_to: self.attributed_to.clone(),
            content: self.content.clone(),
            published: self.published.clone(),
            object: self.payload.clone(),
            origin: self.origin.clone(),
            cache: Cache::default(),
        }
    }
}

/// Persists objects of one kind. `save` must be an idempotent upsert by id.
#[async_trait]
pub trait ObjectInterface: Send + Sync {
    async fn save(&self, object: &RemoteObject) -> Result<(), FetchError>;
}

pub trait ObjectResolver: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<RemoteObject, FetchError>;

    fn interface_for(&self, object: &RemoteObject) -> Result<Arc<dyn ObjectInterface>, FetchError>;
}

/// Stores notes in the local streams table. Notes hosted on `instance_host`
/// are authoritative locally: a fetched copy never replaces a stored one.
pub struct NoteInterface {
    pool: Pool,
    instance_host: String,
}

impl NoteInterface {
    pub fn new(pool: Pool, instance_host: impl Into<String>) -> Self {
        Self {
            pool,
            instance_host: instance_host.into(),
        }
    }

    fn is_local(&self, id: &str) -> bool {
        Url::parse(id)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(self.instance_host.trim())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectInterface for NoteInterface {
    #[instrument(skip_all, fields(id = %object.id))]
    async fn save(&self, object: &RemoteObject) -> Result<(), FetchError> {
        if self.instance_host.trim().is_empty() {
            return Err(FetchError::AppConfig(
                "resolver.instance_host is not set".into(),
            ));
        }
        if self.is_local(&object.id) && db::get_stream_by_id(&self.pool, &object.id).await?.is_some() {
            debug!("local note already stored; keeping it");
            return Ok(());
        }
        db::upsert_stream(&self.pool, &object.to_stream()).await?;
        Ok(())
    }
}

pub struct ActivityResolver {
    redundancy_limit: usize,
    interfaces: HashMap<String, Arc<dyn ObjectInterface>>,
}

impl ActivityResolver {
    pub fn new(redundancy_limit: usize) -> Self {
        Self {
            redundancy_limit,
            interfaces: HashMap::new(),
        }
    }

    /// Resolver with the note interface registered against `pool`.
    pub fn from_config(pool: Pool, cfg: &Config) -> Self {
        let mut resolver = Self::new(cfg.resolver.redundancy_limit);
        resolver.register(
            NOTE,
            Arc::new(NoteInterface::new(pool, cfg.resolver.instance_host.clone())),
        );
        resolver
    }

    pub fn register(&mut self, kind: &str, interface: Arc<dyn ObjectInterface>) {
        self.interfaces.insert(kind.to_string(), interface);
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `type` may be a string or an array whose first string wins.
fn kind_field(obj: &serde_json::Map<String, Value>) -> Option<String> {
    match obj.get("type")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(values) => values.iter().find_map(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Depth of the chain of embedded `object` values.
fn nesting_depth(value: &Value) -> usize {
    let mut depth = 0;
    let mut current = value;
    while let Some(inner) = current.get("object").filter(|v| v.is_object()) {
        depth += 1;
        current = inner;
    }
    depth
}

impl ObjectResolver for ActivityResolver {
    fn parse(&self, bytes: &[u8]) -> Result<RemoteObject, FetchError> {
        let payload: Value = serde_json::from_slice(bytes)
            .map_err(|e| FetchError::RequestResultNotJson(e.to_string()))?;
        let obj = payload
            .as_object()
            .ok_or_else(|| FetchError::MalformedStructure("payload is not an object".into()))?;

        let id = string_field(obj, "id")
            .ok_or_else(|| FetchError::MalformedStructure("missing id".into()))?;
        let kind = kind_field(obj)
            .ok_or_else(|| FetchError::MalformedStructure("missing type".into()))?;
        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(FetchError::ItemUnknown(kind));
        }
        if nesting_depth(&payload) > self.redundancy_limit {
            return Err(FetchError::RedundancyLimit {
                limit: self.redundancy_limit,
            });
        }

        Ok(RemoteObject {
            attributed_to: string_field(obj, "attributedTo"),
            content: string_field(obj, "content"),
            published: string_field(obj, "published"),
            id,
            kind,
            payload,
            origin: None,
        })
    }

    fn interface_for(&self, object: &RemoteObject) -> Result<Arc<dyn ObjectInterface>, FetchError> {
        self.interfaces
            .get(&object.kind)
            .cloned()
            .ok_or_else(|| FetchError::ItemUnknown(object.kind.clone()))
    }
}

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use stream_queue::db;
use stream_queue::resolver::{ActivityResolver, NoteInterface, ObjectInterface, RemoteObject, NOTE};
use stream_queue::transport::Transport;
use stream_queue::{
    Backoff, Cache, CacheItem, CachePipeline, DiscardReason, EntryOutcome, FetchError,
    QueueOptions, QueueStatus, Stream, StreamQueue,
};

const LOCAL_POST: &str = "https://local.example/notes/1";
const REMOTE_A: &str = "https://remote.example/notes/a";
const REMOTE_B: &str = "https://other.example/notes/b";

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Default)]
struct RecordingTransport {
    responses: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, FetchError>>>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingTransport {
    async fn respond(&self, url: &str, res: Result<Vec<u8>, FetchError>) {
        self.responses
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push_back(res);
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.lock().await.push(url.to_string());
        self.responses
            .lock()
            .await
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(FetchError::RequestNetwork("no response queued".into())))
    }
}

struct BrokenStorage;

#[async_trait]
impl ObjectInterface for BrokenStorage {
    async fn save(&self, _object: &RemoteObject) -> Result<(), FetchError> {
        Err(FetchError::Unexpected("disk full".into()))
    }
}

fn build_queue_with(
    pool: &sqlx::SqlitePool,
    transport: Arc<RecordingTransport>,
    interface: Arc<dyn ObjectInterface>,
    options: QueueOptions,
) -> StreamQueue {
    let mut resolver = ActivityResolver::new(8);
    resolver.register(NOTE, interface);
    let pipeline = CachePipeline::new(pool.clone(), transport, Arc::new(resolver));
    StreamQueue::new(pool.clone(), pipeline, Backoff::uncapped(), options)
}

fn build_queue(pool: &sqlx::SqlitePool, transport: Arc<RecordingTransport>) -> StreamQueue {
    let notes = Arc::new(NoteInterface::new(pool.clone(), "local.example"));
    build_queue_with(pool, transport, notes, QueueOptions::default())
}

async fn insert_post(pool: &sqlx::SqlitePool, id: &str, refs: &[&str]) {
    let mut cache = Cache::default();
    for url in refs {
        cache.add_item(CacheItem::new(*url, 1));
    }
    let post = Stream {
        id: id.into(),
        kind: "Note".into(),
        attributed_to: Some("https://local.example/users/alice".into()),
        content: Some("quoting".into()),
        published: None,
        object: json!({ "id": id, "type": "Note" }),
        origin: None,
        cache,
    };
    db::upsert_stream(pool, &post).await.unwrap();
}

fn remote_note(id: &str) -> Vec<u8> {
    json!({
        "id": id,
        "type": "Note",
        "attributedTo": "https://remote.example/users/bob",
        "content": "<p>remote</p>",
    })
    .to_string()
    .into_bytes()
}

async fn cache_of(pool: &sqlx::SqlitePool, id: &str) -> Vec<CacheItem> {
    db::get_stream_by_id(pool, id)
        .await
        .unwrap()
        .unwrap()
        .cache
        .items()
        .to_vec()
}

async fn backdate(pool: &sqlx::SqlitePool, id: i64, tries: u32, last: i64) {
    sqlx::query("UPDATE stream_queue SET tries = ?, last = ? WHERE id = ?")
        .bind(tries)
        .bind(last)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn enqueue_sweep_populates_cache() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let queue = build_queue(&pool, transport.clone());

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let token = StreamQueue::new_token();
    let entry = queue.enqueue(&token, "Cache", LOCAL_POST).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Standby);

    let due = queue.list_due_entries().await.unwrap();
    assert_eq!(due, vec![entry.clone()]);

    let report = queue.run_sweep().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.succeeded, 1);

    let items = cache_of(&pool, LOCAL_POST).await;
    let reloaded = db::get_stream_by_id(&pool, REMOTE_A).await.unwrap().unwrap();
    let content = items[0].content.clone().unwrap();
    assert_eq!(content, reloaded.to_cache_json().unwrap());
    assert!(content.contains(REMOTE_A));
    assert!(!content.contains("\\/"));

    let origin = reloaded.origin.unwrap();
    assert_eq!(origin.host, "remote.example");
    assert_eq!(origin.source, stream_queue::model::OriginSource::Request);

    let stored = db::get_queue_entry(&pool, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Success);
    assert_eq!(stored.tries, 1);

    // succeeded entries leave the standby cycle
    assert!(queue.list_due_entries().await.unwrap().is_empty());
    assert_eq!(transport.calls().await, vec![REMOTE_A.to_string()]);
}

#[tokio::test]
async fn missing_post_deletes_entry() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let queue = build_queue(&pool, transport.clone());

    let entry = queue
        .enqueue("tok", "Cache", "https://local.example/notes/gone")
        .await
        .unwrap();
    let outcome = queue.process_entry(&entry).await.unwrap();
    assert_eq!(
        outcome,
        EntryOutcome::Discarded(DiscardReason::StreamNotFound)
    );
    assert!(db::get_queue_entry(&pool, entry.id).await.unwrap().is_none());
    assert!(transport.calls().await.is_empty());
}

#[tokio::test]
async fn post_without_pending_cache_deletes_entry() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let queue = build_queue(&pool, transport.clone());

    insert_post(&pool, LOCAL_POST, &[]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    let outcome = queue.process_entry(&entry).await.unwrap();
    assert_eq!(
        outcome,
        EntryOutcome::Discarded(DiscardReason::NothingPending)
    );
    assert!(db::get_queue_entry(&pool, entry.id).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_type_is_deleted_even_when_backing_off() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let queue = build_queue(&pool, transport.clone());

    let entry = queue.enqueue("tok", "Refresh", LOCAL_POST).await.unwrap();
    let now = chrono::Utc::now().timestamp();
    backdate(&pool, entry.id, 40, now).await;
    assert!(queue.list_due_entries().await.unwrap().is_empty());

    let outcomes = queue.process_by_token("tok").await.unwrap();
    assert_eq!(
        outcomes,
        vec![EntryOutcome::Discarded(DiscardReason::UnknownType)]
    );
    assert!(db::get_queue_entry(&pool, entry.id).await.unwrap().is_none());
    assert!(transport.calls().await.is_empty());
}

#[tokio::test]
async fn identity_mismatch_drops_item() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport
        .respond(REMOTE_A, Ok(remote_note("https://remote.example/notes/spoofed")))
        .await;
    let queue = build_queue(&pool, transport.clone());

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    let outcome = queue.process_entry(&entry).await.unwrap();
    assert_eq!(
        outcome,
        EntryOutcome::Completed {
            success: true,
            resolved: 0,
            dropped: 1,
            pending: 0,
        }
    );

    let items = cache_of(&pool, LOCAL_POST).await;
    assert!(items[0].content.is_none());
    assert_eq!(items[0].error.as_deref(), Some("invalid_origin"));
    assert!(db::get_stream_by_id(&pool, "https://remote.example/notes/spoofed")
        .await
        .unwrap()
        .is_none());

    // a new entry for the same post finds nothing left to fetch
    let again = queue.enqueue("tok2", "Cache", LOCAL_POST).await.unwrap();
    assert_eq!(
        queue.process_entry(&again).await.unwrap(),
        EntryOutcome::Discarded(DiscardReason::NothingPending)
    );
    assert_eq!(transport.calls().await.len(), 1);
}

#[tokio::test]
async fn non_note_is_dropped_as_invalid_resource() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let person = json!({ "id": REMOTE_A, "type": "Person" }).to_string();
    transport.respond(REMOTE_A, Ok(person.into_bytes())).await;
    let queue = build_queue(&pool, transport);

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    queue.process_entry(&entry).await.unwrap();

    let items = cache_of(&pool, LOCAL_POST).await;
    assert_eq!(items[0].error.as_deref(), Some("invalid_resource"));
}

#[tokio::test]
async fn network_failure_backs_off_then_recovers() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport
        .respond(REMOTE_A, Err(FetchError::RequestNetwork("reset".into())))
        .await;
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let queue = build_queue(&pool, transport.clone());

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();

    let report = queue.run_sweep().await.unwrap();
    assert_eq!(report.failed, 1);
    let stored = db::get_queue_entry(&pool, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failure);
    assert_eq!(stored.tries, 1);
    assert!(cache_of(&pool, LOCAL_POST).await[0].is_pending());

    // tries=1 has no delay, so the next sweep rearms and retries right away
    let report = queue.run_sweep().await.unwrap();
    assert_eq!(report.rearmed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(cache_of(&pool, LOCAL_POST).await[0].content.is_some());
    assert_eq!(transport.calls().await.len(), 2);
}

#[tokio::test]
async fn backoff_filters_due_entries() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let queue = build_queue(&pool, transport);

    let now = 10_000;
    let fresh = queue.enqueue("t", "Cache", LOCAL_POST).await.unwrap();
    let waiting = queue.enqueue("t", "Cache", LOCAL_POST).await.unwrap();
    let ready = queue.enqueue("t", "Cache", LOCAL_POST).await.unwrap();
    // tries=3 -> 27s
    backdate(&pool, waiting.id, 3, now - 26).await;
    backdate(&pool, ready.id, 3, now - 27).await;

    let due: Vec<i64> = queue
        .list_due_entries_at(now)
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(due, vec![fresh.id, ready.id]);

    let due = queue.list_due_entries_at(now + 1).await.unwrap();
    assert_eq!(due.len(), 3);
}

#[tokio::test]
async fn resolved_items_are_not_refetched() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_B, Ok(remote_note(REMOTE_B))).await;
    let queue = build_queue(&pool, transport.clone());

    let mut done = CacheItem::new(REMOTE_A, 1);
    done.content = Some("{\"id\":\"cached\"}".into());
    let post = Stream {
        id: LOCAL_POST.into(),
        kind: "Note".into(),
        attributed_to: None,
        content: None,
        published: None,
        object: json!({}),
        origin: None,
        cache: Cache::new(vec![done, CacheItem::new(REMOTE_B, 1)]),
    };
    db::upsert_stream(&pool, &post).await.unwrap();

    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    queue.process_entry(&entry).await.unwrap();

    assert_eq!(transport.calls().await, vec![REMOTE_B.to_string()]);
    let items = cache_of(&pool, LOCAL_POST).await;
    assert_eq!(items[0].content.as_deref(), Some("{\"id\":\"cached\"}"));
    assert!(items[1].content.is_some());
}

#[tokio::test]
async fn claimed_entry_is_skipped() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let queue = build_queue(&pool, transport.clone());

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    let claimed_at = queue.begin_attempt(&entry).await.unwrap();

    assert_eq!(
        queue.process_entry(&entry).await.unwrap(),
        EntryOutcome::Skipped
    );
    assert!(transport.calls().await.is_empty());

    // completing twice is harmless
    queue.complete_attempt(&entry, claimed_at, true).await.unwrap();
    queue.complete_attempt(&entry, claimed_at, false).await.unwrap();
    let stored = db::get_queue_entry(&pool, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Success);
    assert_eq!(stored.tries, 1);
}

#[tokio::test]
async fn stale_running_entry_is_reclaimed() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let queue = build_queue(&pool, transport);

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    queue.begin_attempt(&entry).await.unwrap();

    let now = chrono::Utc::now().timestamp();
    let report = queue.run_sweep_at(now).await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.due, 0);

    let lease = QueueOptions::default().running_lease_secs as i64;
    let report = queue.run_sweep_at(now + lease + 1).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn unexpected_storage_error_fails_entry() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let queue = build_queue_with(
        &pool,
        transport,
        Arc::new(BrokenStorage),
        QueueOptions::default(),
    );

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();

    let report = queue.run_sweep().await.unwrap();
    assert_eq!(report.errors, 1);
    let stored = db::get_queue_entry(&pool, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failure);
    assert!(cache_of(&pool, LOCAL_POST).await[0].is_pending());
}

#[tokio::test]
async fn concurrent_items_all_resolve() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    let urls: Vec<String> = (0..5)
        .map(|i| format!("https://remote.example/notes/{i}"))
        .collect();
    for url in &urls {
        transport.respond(url, Ok(remote_note(url))).await;
    }
    let notes = Arc::new(NoteInterface::new(pool.clone(), "local.example"));
    let options = QueueOptions {
        item_concurrency: 3,
        ..Default::default()
    };
    let queue = build_queue_with(&pool, transport.clone(), notes, options);

    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    insert_post(&pool, LOCAL_POST, &refs).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    let outcome = queue.process_entry(&entry).await.unwrap();
    assert_eq!(
        outcome,
        EntryOutcome::Completed {
            success: true,
            resolved: 5,
            dropped: 0,
            pending: 0,
        }
    );

    let items = cache_of(&pool, LOCAL_POST).await;
    let order: Vec<&str> = items.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(order, refs);
    assert!(items.iter().all(|i| i.content.is_some()));
    assert_eq!(transport.calls().await.len(), 5);
}

#[tokio::test]
async fn token_keeps_going_after_an_entry_aborts() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let queue = build_queue_with(
        &pool,
        transport,
        Arc::new(BrokenStorage),
        QueueOptions::default(),
    );

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let broken = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    let unknown = queue.enqueue("tok", "Refresh", LOCAL_POST).await.unwrap();

    let outcomes = queue.process_by_token("tok").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(
        matches!(&outcomes[0], EntryOutcome::Aborted(msg) if msg.contains("disk full")),
        "{outcomes:?}"
    );
    assert_eq!(
        outcomes[1],
        EntryOutcome::Discarded(DiscardReason::UnknownType)
    );

    let stored = db::get_queue_entry(&pool, broken.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failure);
    assert!(db::get_queue_entry(&pool, unknown.id).await.unwrap().is_none());
}

#[tokio::test]
async fn unset_instance_host_leaves_item_and_fails_entry() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let notes = Arc::new(NoteInterface::new(pool.clone(), ""));
    let queue = build_queue_with(&pool, transport, notes, QueueOptions::default());

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    let outcome = queue.process_entry(&entry).await.unwrap();
    assert_eq!(
        outcome,
        EntryOutcome::Completed {
            success: false,
            resolved: 0,
            dropped: 0,
            pending: 1,
        }
    );

    let items = cache_of(&pool, LOCAL_POST).await;
    assert_eq!(items[0], CacheItem::new(REMOTE_A, 1));
    let stored = db::get_queue_entry(&pool, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failure);
    assert_eq!(stored.tries, 1);
    assert!(db::get_stream_by_id(&pool, REMOTE_A).await.unwrap().is_none());
}

#[tokio::test]
async fn fetched_copy_does_not_replace_local_note() {
    let pool = setup_pool().await;
    let local_ref = "https://local.example/notes/2";
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(local_ref, Ok(remote_note(local_ref))).await;
    let queue = build_queue(&pool, transport);

    insert_post(&pool, local_ref, &[]).await;
    insert_post(&pool, LOCAL_POST, &[local_ref]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();
    queue.process_entry(&entry).await.unwrap();

    let stored = db::get_stream_by_id(&pool, local_ref).await.unwrap().unwrap();
    assert_eq!(stored.content.as_deref(), Some("quoting"));
    let items = cache_of(&pool, LOCAL_POST).await;
    assert_eq!(items[0].content, Some(stored.to_cache_json().unwrap()));
}

async fn wait_for_status(pool: &sqlx::SqlitePool, id: i64, status: QueueStatus) {
    let poll = async {
        loop {
            let entry = db::get_queue_entry(pool, id).await.unwrap().unwrap();
            if entry.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("entry never reached status");
}

#[tokio::test]
async fn worker_loop_processes_and_stops_on_shutdown() {
    let pool = setup_pool().await;
    let transport = Arc::new(RecordingTransport::default());
    transport.respond(REMOTE_A, Ok(remote_note(REMOTE_A))).await;
    let queue = Arc::new(build_queue(&pool, transport));

    insert_post(&pool, LOCAL_POST, &[REMOTE_A]).await;
    let entry = queue.enqueue("tok", "Cache", LOCAL_POST).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .run_forever(Duration::from_millis(20), shutdown_rx)
                .await
        })
    };

    wait_for_status(&pool, entry.id, QueueStatus::Success).await;
    assert!(cache_of(&pool, LOCAL_POST).await[0].content.is_some());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn worker_loop_stops_when_sender_is_dropped() {
    let pool = setup_pool().await;
    let queue = Arc::new(build_queue(&pool, Arc::new(RecordingTransport::default())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .run_forever(Duration::from_secs(3600), shutdown_rx)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
}

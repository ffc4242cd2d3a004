use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use skysift_core::event::EventKind;
use skysift_core::filter::{FilterExpr, OnErrorPolicy};
use skysift_core::id::{Hashtag, PostUri, StoreName};
use skysift_core::source::DataSource;
use skysift_filter::{LinkValidator, OracleResult, Oracles};
use skysift_store::{EvaluationMode, StoreCatalog, StoreConfig, StoreRegistry};
use tempfile::TempDir;
use tokio::sync::watch;

use crate::derive::{DerivationEngine, DeriveOptions};
use crate::engine::{CommitPolicy, ProgressReporter, SyncEngine, SyncOptions, SyncProgress};
use crate::error::{BskyError, SyncError, SyncStage};
use crate::feed::{
    CommitMessage, FeedOptions, FeedSource, JetstreamOptions, RawPost, RawPostStream,
};
use crate::settings::SyncSettings;

fn feed_item(rkey: &str, author: &str, text: &str, tags: &[&str], created_at: &str) -> serde_json::Value {
    let facets: Vec<serde_json::Value> = tags
        .iter()
        .map(|tag| {
            json!({"features": [{"$type": "app.bsky.richtext.facet#tag", "tag": tag}]})
        })
        .collect();
    json!({
        "post": {
            "uri": format!("at://did:plc:{author}/app.bsky.feed.post/{rkey}"),
            "cid": "bafyreib2rxk3rh6kzwq",
            "author": {"did": format!("did:plc:{author}"), "handle": format!("{author}.test")},
            "record": {
                "text": text,
                "createdAt": created_at,
                "facets": facets
            }
        }
    })
}

fn item_with_link(rkey: &str, url: &str) -> serde_json::Value {
    json!({
        "post": {
            "uri": format!("at://did:plc:alice/app.bsky.feed.post/{rkey}"),
            "cid": "bafyreib2rxk3rh6kzwq",
            "author": {"did": "did:plc:alice", "handle": "alice.test"},
            "record": {
                "text": "link post",
                "createdAt": "2024-06-01T10:00:00Z",
                "facets": [{"features": [{"$type": "app.bsky.richtext.facet#link", "uri": url}]}]
            }
        }
    })
}

/// Paginated in-memory feed. Cursors are item indices encoded as strings;
/// every item of a page carries the cursor of the next page, the way a real
/// paged API hands out cursors at page boundaries.
struct StaticFeed {
    items: Vec<serde_json::Value>,
    page_size: usize,
}

impl StaticFeed {
    fn new(items: Vec<serde_json::Value>) -> Self {
        Self {
            items,
            page_size: 50,
        }
    }

    fn stream_from(&self, cursor: Option<String>) -> RawPostStream {
        let start = cursor
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(self.items.len());
        let page_size = self.page_size;
        let items = self.items.clone();
        Box::pin(stream::iter((start..items.len()).map(move |i| {
            let page_end = (i / page_size + 1) * page_size;
            Ok(RawPost {
                value: items[i].clone(),
                page_cursor: Some(page_end.to_string()),
            })
        })))
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn get_timeline(&self, opts: FeedOptions) -> Result<RawPostStream, BskyError> {
        Ok(self.stream_from(opts.cursor))
    }

    async fn get_feed(&self, _uri: &str, opts: FeedOptions) -> Result<RawPostStream, BskyError> {
        Ok(self.stream_from(opts.cursor))
    }

    async fn get_list_feed(
        &self,
        _uri: &str,
        opts: FeedOptions,
    ) -> Result<RawPostStream, BskyError> {
        Ok(self.stream_from(opts.cursor))
    }

    async fn get_notifications(&self, opts: FeedOptions) -> Result<RawPostStream, BskyError> {
        Ok(self.stream_from(opts.cursor))
    }

    async fn get_author_feed(
        &self,
        _actor: &str,
        opts: FeedOptions,
    ) -> Result<RawPostStream, BskyError> {
        Ok(self.stream_from(opts.cursor))
    }

    async fn get_post_thread(
        &self,
        _uri: &PostUri,
        _depth: Option<u32>,
        _parent_height: Option<u32>,
    ) -> Result<Vec<RawPost>, BskyError> {
        Ok(self
            .items
            .iter()
            .map(|value| RawPost {
                value: value.clone(),
                page_cursor: None,
            })
            .collect())
    }

    async fn jetstream(
        &self,
        _opts: JetstreamOptions,
    ) -> Result<crate::feed::CommitStream, BskyError> {
        Err(BskyError::Firehose {
            message: "not a firehose fake".to_owned(),
        })
    }
}

/// Firehose fake: replays canned messages, honoring the cursor.
struct StaticJetstream {
    messages: Vec<Result<CommitMessage, BskyError>>,
}

#[async_trait]
impl FeedSource for StaticJetstream {
    async fn get_timeline(&self, _opts: FeedOptions) -> Result<RawPostStream, BskyError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn get_feed(&self, _uri: &str, _opts: FeedOptions) -> Result<RawPostStream, BskyError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn get_list_feed(
        &self,
        _uri: &str,
        _opts: FeedOptions,
    ) -> Result<RawPostStream, BskyError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn get_notifications(&self, _opts: FeedOptions) -> Result<RawPostStream, BskyError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn get_author_feed(
        &self,
        _actor: &str,
        _opts: FeedOptions,
    ) -> Result<RawPostStream, BskyError> {
        Ok(Box::pin(stream::empty()))
    }

    async fn get_post_thread(
        &self,
        _uri: &PostUri,
        _depth: Option<u32>,
        _parent_height: Option<u32>,
    ) -> Result<Vec<RawPost>, BskyError> {
        Ok(vec![])
    }

    async fn jetstream(
        &self,
        opts: JetstreamOptions,
    ) -> Result<crate::feed::CommitStream, BskyError> {
        let after: Option<u64> = opts.cursor.and_then(|c| c.parse().ok());
        let messages: Vec<_> = self
            .messages
            .iter()
            .filter(|message| match (message, after) {
                (Ok(m), Some(after)) => after < m.time_us,
                _ => true,
            })
            .cloned()
            .collect();
        Ok(Box::pin(stream::iter(messages)))
    }
}

fn commit_message(op: &str, rkey: &str, time_us: u64, tags: &[&str]) -> CommitMessage {
    let facets: Vec<serde_json::Value> = tags
        .iter()
        .map(|tag| json!({"features": [{"$type": "app.bsky.richtext.facet#tag", "tag": tag}]}))
        .collect();
    let record = if op == "delete" {
        serde_json::Value::Null
    } else {
        json!({
            "text": format!("firehose {rkey}"),
            "createdAt": "2024-06-01T10:00:00Z",
            "facets": facets
        })
    };
    serde_json::from_value(json!({
        "did": "did:plc:alice",
        "time_us": time_us,
        "commit": {
            "operation": op,
            "collection": "app.bsky.feed.post",
            "rkey": rkey,
            "cid": "bafyreib2rxk3rh6kzwq",
            "record": record
        }
    }))
    .unwrap()
}

struct CountingValidator {
    calls: AtomicU32,
}

#[async_trait]
impl LinkValidator for CountingValidator {
    async fn is_valid(&self, _url: &str) -> OracleResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct CountingReporter {
    reports: Mutex<Vec<SyncProgress>>,
}

impl ProgressReporter for CountingReporter {
    fn report(&self, progress: &SyncProgress) {
        self.reports
            .lock()
            .expect("Locking failed")
            .push(progress.clone());
    }
}

struct TestEnv {
    _dir: TempDir,
    registry: Arc<StoreRegistry>,
    store: StoreName,
}

async fn env_with_store() -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(StoreCatalog::open(dir.path()).await.expect("catalog"));
    let registry = Arc::new(StoreRegistry::new(catalog));
    let store: StoreName = "main".parse().unwrap();
    registry
        .create(&store, None, StoreConfig::default())
        .await
        .expect("create store");
    TestEnv {
        _dir: dir,
        registry,
        store,
    }
}

fn fast_settings() -> SyncSettings {
    SyncSettings {
        heartbeat_interval_ms: 10,
        ..Default::default()
    }
}

fn engine_with(env: &TestEnv, feed: Arc<dyn FeedSource>, oracles: Oracles) -> SyncEngine {
    SyncEngine::builder()
        .registry(env.registry.clone())
        .feed(feed)
        .oracles(oracles)
        .settings(fast_settings())
        .build()
}

fn never_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the whole test process.
    std::mem::forget(tx);
    rx
}

fn tag(t: &str) -> FilterExpr {
    FilterExpr::Hashtag {
        tag: t.parse::<Hashtag>().unwrap(),
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn dedupe_sync_skips_duplicate_posts() {
    let env = env_with_store().await;
    let a = feed_item("3ka", "alice", "first", &[], "2024-06-01T10:00:00Z");
    let b = feed_item("3kb", "bob", "second", &[], "2024-06-01T11:00:00Z");
    let feed = Arc::new(StaticFeed::new(vec![a.clone(), b, a]));
    let engine = engine_with(&env, feed, Oracles::none());

    let result = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::builder().policy(CommitPolicy::Dedupe).build(),
            never_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(result.posts_added, 2);
    assert_eq!(result.posts_skipped, 1);
    assert!(result.errors.is_empty());

    let store = env.registry.open(&env.store).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
    let log = store.read_log(None, 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.event.kind() == EventKind::Upsert));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn refresh_sync_records_every_upsert() {
    let env = env_with_store().await;
    let a = feed_item("3ka", "alice", "first", &[], "2024-06-01T10:00:00Z");
    let b = feed_item("3kb", "bob", "second", &[], "2024-06-01T11:00:00Z");
    let feed = Arc::new(StaticFeed::new(vec![a.clone(), b, a]));
    let engine = engine_with(&env, feed, Oracles::none());

    let result = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::builder().policy(CommitPolicy::Refresh).build(),
            never_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(result.posts_added, 3);
    assert_eq!(result.posts_skipped, 0);

    let store = env.registry.open(&env.store).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(store.read_log(None, 10).await.unwrap().len(), 3);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn short_circuit_never_invokes_the_oracle() {
    let env = env_with_store().await;
    let items: Vec<_> = (0..100)
        .map(|i| item_with_link(&format!("3k{i:03}"), "https://example.com"))
        .collect();
    let feed = Arc::new(StaticFeed::new(items));
    let validator = Arc::new(CountingValidator {
        calls: AtomicU32::new(0),
    });
    let engine = engine_with(
        &env,
        feed,
        Oracles {
            link_validator: Some(validator.clone()),
            trending: None,
        },
    );

    let filter = FilterExpr::and(vec![
        FilterExpr::None,
        FilterExpr::HasValidLinks {
            on_error: OnErrorPolicy::Include,
        },
    ]);
    let result = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &filter,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(result.posts_added, 0);
    assert_eq!(result.posts_skipped, 100);
    assert!(result.errors.is_empty());
    assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn interrupted_sync_resumes_from_checkpoint_without_duplicates() {
    let env = env_with_store().await;
    let items: Vec<_> = (0..1000)
        .map(|i| {
            feed_item(
                &format!("3k{i:04}"),
                "alice",
                &format!("item {i}"),
                &[],
                "2024-06-01T10:00:00Z",
            )
        })
        .collect();
    let feed: Arc<dyn FeedSource> = Arc::new(StaticFeed::new(items));
    let engine = engine_with(&env, feed.clone(), Oracles::none());

    // First run stops after 150 items, as if the process died there.
    let first = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::builder().limit(150u64).build(),
            never_cancel(),
        )
        .await
        .unwrap();
    assert_eq!(first.posts_added, 150);

    let store = env.registry.open(&env.store).await.unwrap();
    let checkpoint = store
        .load_sync_checkpoint(&DataSource::Timeline, &FilterExpr::All.signature())
        .await
        .unwrap()
        .expect("checkpoint persisted");
    assert_eq!(checkpoint.cursor.as_deref(), Some("150"));

    // Second run resumes at the cursor and finishes the feed.
    let second = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();
    assert_eq!(second.posts_added, 850);
    assert_eq!(second.posts_skipped, 0);

    assert_eq!(store.count().await.unwrap(), 1000);
    assert_eq!(store.read_log(None, 2000).await.unwrap().len(), 1000);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn changed_filter_ignores_the_checkpoint() {
    let env = env_with_store().await;
    let items: Vec<_> = (0..10)
        .map(|i| {
            feed_item(
                &format!("3k{i}"),
                "alice",
                "text",
                &["tech"],
                "2024-06-01T10:00:00Z",
            )
        })
        .collect();
    let feed: Arc<dyn FeedSource> = Arc::new(StaticFeed::new(items));
    let engine = engine_with(&env, feed.clone(), Oracles::none());

    engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();

    // New filter: the old checkpoint must not be trusted, so all ten items
    // are re-processed (and deduped away).
    let result = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &tag("tech"),
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();
    assert_eq!(result.posts_added, 0);
    assert_eq!(result.posts_skipped, 10);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn parse_failures_are_recorded_per_item() {
    let env = env_with_store().await;
    let good = feed_item("3ka", "alice", "ok", &[], "2024-06-01T10:00:00Z");
    let bad = json!({"post": {"uri": "not-a-uri"}});
    let good2 = feed_item("3kb", "bob", "ok too", &[], "2024-06-01T11:00:00Z");
    let feed = Arc::new(StaticFeed::new(vec![good, bad, good2]));
    let engine = engine_with(&env, feed, Oracles::none());

    let result = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(result.posts_added, 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].stage, SyncStage::Parse);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn syncing_into_a_missing_store_fails() {
    let env = env_with_store().await;
    let feed = Arc::new(StaticFeed::new(vec![]));
    let engine = engine_with(&env, feed, Oracles::none());

    let missing: StoreName = "nope".parse().unwrap();
    let err = engine
        .sync(
            &DataSource::Timeline,
            &missing,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Catalog { .. }));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancellation_returns_partial_result_and_flushes_checkpoint() {
    let env = env_with_store().await;
    let items: Vec<_> = (0..20_000)
        .map(|i| {
            feed_item(
                &format!("3k{i:05}"),
                "alice",
                "endless",
                &[],
                "2024-06-01T10:00:00Z",
            )
        })
        .collect();
    let feed = Arc::new(StaticFeed::new(items));
    let engine = engine_with(&env, feed, Oracles::none());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = cancel_tx.send(true);
    });

    let result = engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            cancel_rx,
        )
        .await
        .unwrap();

    let store = env.registry.open(&env.store).await.unwrap();
    let count = store.count().await.unwrap();
    assert!(count < 20_000, "cancellation should stop the run early");
    assert_eq!(result.posts_added, count);

    // Whatever was committed is covered by the checkpoint.
    let checkpoint = store
        .load_sync_checkpoint(&DataSource::Timeline, &FilterExpr::All.signature())
        .await
        .unwrap();
    assert!(checkpoint.is_some());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn heartbeat_reports_progress() {
    let env = env_with_store().await;
    let items: Vec<_> = (0..20)
        .map(|i| feed_item(&format!("3k{i}"), "alice", "x", &[], "2024-06-01T10:00:00Z"))
        .collect();
    let feed: Arc<dyn FeedSource> = Arc::new(StaticFeed::new(items));
    let reporter = Arc::new(CountingReporter {
        reports: Mutex::new(Vec::new()),
    });
    let engine = SyncEngine::builder()
        .registry(env.registry.clone())
        .feed(feed)
        .settings(fast_settings())
        .reporter(reporter.clone())
        .build();

    engine
        .sync(
            &DataSource::Timeline,
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();

    let reports = reporter.reports.lock().expect("Locking failed");
    assert!(!reports.is_empty());
    let last = reports.last().unwrap();
    assert_eq!(last.processed, 20);
    assert_eq!(last.stored, 20);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn jetstream_maps_commit_operations() {
    let env = env_with_store().await;
    let messages = vec![
        Ok(commit_message("create", "3ka", 1, &["tech"])),
        Ok(commit_message("create", "3ka", 2, &["tech"])),
        Err(BskyError::FirehoseDecode {
            message: "garbage frame".to_owned(),
        }),
        Ok(commit_message("update", "3ka", 3, &["tech"])),
        Ok(commit_message("create", "3kb", 4, &["tech"])),
        Ok(commit_message("delete", "3ka", 5, &[])),
    ];
    let feed = Arc::new(StaticJetstream { messages });
    let engine = engine_with(&env, feed, Oracles::none());

    let source = DataSource::Jetstream {
        endpoint: None,
        collections: None,
        dids: None,
        compress: None,
        max_message_size_bytes: None,
    };
    let result = engine
        .sync(
            &DataSource::Jetstream {
                endpoint: None,
                collections: None,
                dids: None,
                compress: None,
                max_message_size_bytes: None,
            },
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap();

    // create 3ka, update 3ka, create 3kb stored; duplicate create deduped;
    // delete 3ka propagated; one decode error recorded.
    assert_eq!(result.posts_added, 3);
    assert_eq!(result.posts_deleted, 1);
    assert_eq!(result.posts_skipped, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].stage, SyncStage::Source);

    let store = env.registry.open(&env.store).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);

    let checkpoint = store
        .load_sync_checkpoint(&source, &FilterExpr::All.signature())
        .await
        .unwrap()
        .expect("checkpoint");
    assert_eq!(checkpoint.cursor.as_deref(), Some("5"));

    // Jetstream posts get the placeholder handle when no resolver is wired.
    let b_uri: PostUri = "at://did:plc:alice/app.bsky.feed.post/3kb".parse().unwrap();
    let post = store.get_post(&b_uri).await.unwrap().unwrap();
    assert_eq!(post.author.as_str(), "handle.invalid");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn jetstream_strict_mode_aborts_on_decode_error() {
    let env = env_with_store().await;
    let messages = vec![
        Err(BskyError::FirehoseDecode {
            message: "garbage frame".to_owned(),
        }),
        Ok(commit_message("create", "3ka", 1, &[])),
    ];
    let feed: Arc<dyn FeedSource> = Arc::new(StaticJetstream { messages });
    let engine = SyncEngine::builder()
        .registry(env.registry.clone())
        .feed(feed)
        .settings(SyncSettings {
            strict: true,
            ..fast_settings()
        })
        .build();

    let err = engine
        .sync(
            &DataSource::Jetstream {
                endpoint: None,
                collections: None,
                dids: None,
                compress: None,
                max_message_size_bytes: None,
            },
            &env.store,
            &FilterExpr::All,
            SyncOptions::default(),
            never_cancel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Source { .. }));
}

async fn seed_source_store(env: &TestEnv) -> StoreName {
    let source: StoreName = "source".parse().unwrap();
    env.registry
        .create(&source, None, StoreConfig::default())
        .await
        .unwrap();
    source
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn derivation_propagates_deletes_for_posts_that_stop_matching() {
    let env = env_with_store().await;
    let source = seed_source_store(&env).await;
    let source_db = env.registry.open(&source).await.unwrap();

    let meta = skysift_core::event::EventMeta {
        source: skysift_core::event::SourceKind::Timeline,
        command: "seed".to_owned(),
        filter_expr_hash: None,
        created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
    };
    let mut a = fixture_post("3ka", &["tech"]);
    let b = fixture_post("3kb", &["tech"]);
    source_db.append_upsert(&a, &meta).await.unwrap();
    source_db.append_upsert(&b, &meta).await.unwrap();
    // A loses its tag.
    a.hashtags.clear();
    source_db.append_upsert(&a, &meta).await.unwrap();

    let derive = DerivationEngine::builder()
        .registry(env.registry.clone())
        .build();
    let target: StoreName = "tech-view".parse().unwrap();
    let result = derive
        .derive(
            &source,
            &target,
            &tag("tech"),
            DeriveOptions::builder().create_target(true).build(),
        )
        .await
        .unwrap();

    assert_eq!(result.events_processed, 3);
    assert_eq!(result.events_matched, 2);
    assert_eq!(result.deletes_propagated, 1);

    let target_db = env.registry.open(&target).await.unwrap();
    assert_eq!(target_db.count().await.unwrap(), 1);
    assert!(target_db.contains(&b.uri).await.unwrap());
    assert!(!target_db.contains(&a.uri).await.unwrap());

    let kinds: Vec<EventKind> = target_db
        .read_log(None, 10)
        .await
        .unwrap()
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![EventKind::Upsert, EventKind::Upsert, EventKind::Delete]
    );

    // Lineage is recorded on the auto-created target.
    let config = env.registry.catalog().get_config(&target).await.unwrap();
    let lineage = config.lineage.expect("lineage recorded");
    assert_eq!(lineage.source_store, source);
    assert_eq!(lineage.evaluation_mode, EvaluationMode::DeriveTime);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn derivation_resumes_incrementally_and_tracks_staleness() {
    let env = env_with_store().await;
    let source = seed_source_store(&env).await;
    let source_db = env.registry.open(&source).await.unwrap();
    let meta = skysift_core::event::EventMeta {
        source: skysift_core::event::SourceKind::Timeline,
        command: "seed".to_owned(),
        filter_expr_hash: None,
        created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
    };

    for i in 0..5 {
        let p = fixture_post(&format!("3k{i}"), &["tech"]);
        source_db.append_upsert(&p, &meta).await.unwrap();
    }

    let derive = DerivationEngine::builder()
        .registry(env.registry.clone())
        .build();
    let target: StoreName = "view".parse().unwrap();

    // Missing source: nothing to derive from, so not stale.
    let ghost: StoreName = "ghost".parse().unwrap();
    assert!(!derive.is_stale("view", &ghost, &target).await.unwrap());
    // Missing checkpoint: stale.
    assert!(derive.is_stale("view", &source, &target).await.unwrap());

    let first = derive
        .derive(
            &source,
            &target,
            &tag("tech"),
            DeriveOptions::builder().create_target(true).build(),
        )
        .await
        .unwrap();
    assert_eq!(first.events_processed, 5);
    assert!(!derive.is_stale("view", &source, &target).await.unwrap());

    // More source events: stale again, and only the delta is replayed.
    for i in 5..8 {
        let p = fixture_post(&format!("3k{i}"), &["tech"]);
        source_db.append_upsert(&p, &meta).await.unwrap();
    }
    assert!(derive.is_stale("view", &source, &target).await.unwrap());

    let second = derive
        .derive(
            &source,
            &target,
            &tag("tech"),
            DeriveOptions::builder().create_target(true).build(),
        )
        .await
        .unwrap();
    assert_eq!(second.events_processed, 3);

    // Incremental result equals a full re-derivation into a fresh target.
    let fresh: StoreName = "view-fresh".parse().unwrap();
    derive
        .derive(
            &source,
            &fresh,
            &tag("tech"),
            DeriveOptions::builder().create_target(true).build(),
        )
        .await
        .unwrap();

    let target_db = env.registry.open(&target).await.unwrap();
    let fresh_db = env.registry.open(&fresh).await.unwrap();
    assert_eq!(
        target_db.count().await.unwrap(),
        fresh_db.count().await.unwrap()
    );
    assert_eq!(target_db.count().await.unwrap(), 8);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn event_time_derivation_rejects_effectful_filters() {
    let env = env_with_store().await;
    let source = seed_source_store(&env).await;
    let derive = DerivationEngine::builder()
        .registry(env.registry.clone())
        .build();

    let target: StoreName = "view".parse().unwrap();
    let err = derive
        .derive(
            &source,
            &target,
            &FilterExpr::HasValidLinks {
                on_error: OnErrorPolicy::Exclude,
            },
            DeriveOptions::builder()
                .evaluation_mode(EvaluationMode::EventTime)
                .create_target(true)
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::EventTimeEffectful));
}

pub(crate) fn fixture_post(rkey: &str, tags: &[&str]) -> skysift_core::post::Post {
    skysift_core::post::Post {
        uri: format!("at://did:plc:seed/app.bsky.feed.post/{rkey}")
            .parse()
            .unwrap(),
        cid: "bafyreib2rxk3rh6kzwq".parse().unwrap(),
        author: "seed.test".parse().unwrap(),
        author_did: "did:plc:seed".parse().unwrap(),
        text: format!("seeded {rkey}"),
        created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
        hashtags: tags.iter().map(|t| t.parse().unwrap()).collect(),
        mentions: Default::default(),
        links: Default::default(),
        embed: None,
        reply: None,
        reason: None,
        metrics: None,
        langs: None,
    }
}

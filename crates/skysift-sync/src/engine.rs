//! The sync pipeline: source → parse → filter → batch → commit → checkpoint.
//!
//! Ordering: raw input order is preserved end to end. Parse and filter run
//! with bounded concurrency through an ordered buffer; the commit step is
//! serial per store. The checkpoint cursor only ever covers items that are
//! either committed or deliberately skipped, so a crash never resumes past
//! uncommitted work.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use serde::Serialize;
use skysift_core::event::{EventMeta, EventSeq};
use skysift_core::filter::{FilterExpr, FilterHash};
use skysift_core::id::StoreName;
use skysift_core::post::Post;
use skysift_core::source::DataSource;
use skysift_core::time::Timestamp;
use skysift_filter::{compile, FilterRuntime, IdentityResolver, Oracles};
use skysift_store::{StoreDb, StoreRegistry, SyncCheckpoint};
use snafu::ResultExt as _;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::error::{BskyError, SourceSnafu, SyncError, SyncItemError, SyncStage};
use crate::feed::{FeedOptions, FeedSource, RawPostStream};
use crate::parse::parse_raw_post;
use crate::settings::SyncSettings;
use crate::{jetstream, LOG_TARGET};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPolicy {
    /// Skip posts whose URI is already stored.
    #[default]
    Dedupe,
    /// Re-upsert everything, recording a fresh event per item.
    Refresh,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub policy: CommitPolicy,
    /// Stop after this many raw items.
    pub limit: Option<u64>,
    /// Overrides `SyncSettings::concurrency` for this run.
    pub concurrency: Option<usize>,
}

#[bon::bon]
impl SyncOptions {
    #[builder]
    pub fn new(
        policy: Option<CommitPolicy>,
        limit: Option<u64>,
        concurrency: Option<usize>,
    ) -> Self {
        Self {
            policy: policy.unwrap_or_default(),
            limit,
            concurrency,
        }
    }
}

/// What one sync invocation did. Serializable for CLI/JSON output.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub posts_added: u64,
    pub posts_deleted: u64,
    pub posts_skipped: u64,
    pub errors: Vec<SyncItemError>,
}

/// Periodic progress snapshot handed to the reporter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub processed: u64,
    pub stored: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errors: u64,
    pub cursor: Option<String>,
    pub elapsed_ms: u64,
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &SyncProgress);
}

/// Default reporter: a log line per heartbeat.
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, progress: &SyncProgress) {
        info!(
            target: LOG_TARGET,
            processed = progress.processed,
            stored = progress.stored,
            skipped = progress.skipped,
            errors = progress.errors,
            elapsed_ms = progress.elapsed_ms,
            "Sync progress"
        );
    }
}

/// Mutable run state, shared with the heartbeat task.
pub(crate) struct SyncState {
    pub processed: u64,
    pub added: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errors: Vec<SyncItemError>,
    /// Page cursor covering only committed/skipped items.
    pub cursor: Option<String>,
    pub last_seq: Option<EventSeq>,
    pub started: Instant,
}

pub(crate) type SharedState = Arc<Mutex<SyncState>>;

impl SyncState {
    pub(crate) fn new(checkpoint: Option<&SyncCheckpoint>) -> SharedState {
        Arc::new(Mutex::new(SyncState {
            processed: 0,
            added: 0,
            deleted: 0,
            skipped: 0,
            errors: Vec::new(),
            cursor: checkpoint.and_then(|c| c.cursor.clone()),
            last_seq: checkpoint.and_then(|c| c.last_event_seq),
            started: Instant::now(),
        }))
    }

    pub(crate) fn progress(&self) -> SyncProgress {
        SyncProgress {
            processed: self.processed,
            stored: self.added,
            deleted: self.deleted,
            skipped: self.skipped,
            errors: self.errors.len() as u64,
            cursor: self.cursor.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn into_result(state: SharedState) -> SyncResult {
        let state = state.lock().expect("Locking failed");
        SyncResult {
            posts_added: state.added,
            posts_deleted: state.deleted,
            posts_skipped: state.skipped,
            errors: state.errors.clone(),
        }
    }
}

/// Spawns the heartbeat fiber. Returns the stop handle; flipping it to true
/// (or dropping it) ends the task.
pub(crate) fn spawn_heartbeat(
    state: SharedState,
    reporter: Arc<dyn ProgressReporter>,
    interval_ms: u64,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let progress = state.lock().expect("Locking failed").progress();
                    reporter.report(&progress);
                }
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    (stop_tx, handle)
}

/// Per-item outcome of the parse+filter stages.
enum StageOutcome {
    Accepted {
        post: Box<Post>,
        cursor: Option<String>,
    },
    Rejected {
        cursor: Option<String>,
    },
    Failed {
        error: SyncItemError,
        cursor: Option<String>,
    },
    SourceFailed {
        error: BskyError,
    },
}

pub struct SyncEngine {
    pub(crate) registry: Arc<StoreRegistry>,
    pub(crate) feed: Arc<dyn FeedSource>,
    pub(crate) oracles: Oracles,
    pub(crate) resolver: Option<Arc<dyn IdentityResolver>>,
    pub(crate) settings: SyncSettings,
    pub(crate) reporter: Arc<dyn ProgressReporter>,
}

#[bon::bon]
impl SyncEngine {
    #[builder]
    pub fn new(
        registry: Arc<StoreRegistry>,
        feed: Arc<dyn FeedSource>,
        oracles: Option<Oracles>,
        resolver: Option<Arc<dyn IdentityResolver>>,
        settings: Option<SyncSettings>,
        reporter: Option<Arc<dyn ProgressReporter>>,
    ) -> Self {
        Self {
            registry,
            feed,
            oracles: oracles.unwrap_or_default(),
            resolver,
            settings: settings.unwrap_or_default(),
            reporter: reporter.unwrap_or_else(|| Arc::new(TracingReporter)),
        }
    }
}

impl SyncEngine {
    /// Runs one sync of `source` into `target`. The target store must exist.
    ///
    /// Cancellation: flip the watch to true. The in-flight batch is
    /// discarded whole, the checkpoint is flushed, and the partial result is
    /// returned.
    #[instrument(name = "sync", skip_all, fields(store = %target, source = %source.source_key()))]
    pub async fn sync(
        &self,
        source: &DataSource,
        target: &StoreName,
        filter: &FilterExpr,
        options: SyncOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncResult, SyncError> {
        let compiled = compile(filter)?;
        let hash = compiled.hash();
        let store = self.registry.open(target).await?;
        let checkpoint = store.load_sync_checkpoint(source, &hash).await?;
        if let Some(checkpoint) = &checkpoint {
            debug!(
                target: LOG_TARGET,
                cursor = ?checkpoint.cursor,
                last_seq = ?checkpoint.last_event_seq,
                "Resuming from checkpoint"
            );
        }
        let concurrency = options.concurrency.unwrap_or(self.settings.concurrency).max(1);
        let runtime = Arc::new(
            FilterRuntime::new(compiled, self.oracles.clone()).with_batch_concurrency(concurrency),
        );

        if matches!(source, DataSource::Jetstream { .. }) {
            return jetstream::run(self, &store, source, runtime, checkpoint, &options, cancel)
                .await;
        }

        let raw_stream = open_source_stream(
            self.feed.as_ref(),
            source,
            checkpoint.as_ref().and_then(|c| c.cursor.clone()),
            self.settings.page_limit,
        )
        .await
        .context(SourceSnafu)?;

        let state = SyncState::new(checkpoint.as_ref());
        let (heartbeat_stop, heartbeat) = spawn_heartbeat(
            state.clone(),
            self.reporter.clone(),
            self.settings.heartbeat_interval_ms,
        );

        let run = self
            .run_paginated(
                raw_stream,
                &store,
                source,
                target,
                hash,
                &options,
                runtime,
                state.clone(),
                cancel,
            )
            .await;

        let _ = heartbeat_stop.send(true);
        let _ = heartbeat.await;
        self.reporter
            .report(&state.lock().expect("Locking failed").progress());

        run?;
        Ok(SyncState::into_result(state))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_paginated(
        &self,
        raw_stream: RawPostStream,
        store: &Arc<StoreDb>,
        source: &DataSource,
        target: &StoreName,
        hash: FilterHash,
        options: &SyncOptions,
        runtime: Arc<FilterRuntime>,
        state: SharedState,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let command = format!("sync {} {}", source.source_key(), target);
        let concurrency = options.concurrency.unwrap_or(self.settings.concurrency).max(1);
        let limit = options
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);

        let mut staged = raw_stream
            .take(limit)
            .map(|item| {
                let runtime = runtime.clone();
                async move {
                    match item {
                        Err(error) => StageOutcome::SourceFailed { error },
                        Ok(raw) => {
                            let cursor = raw.page_cursor.clone();
                            match parse_raw_post(&raw) {
                                Err(err) => StageOutcome::Failed {
                                    error: SyncItemError {
                                        stage: SyncStage::Parse,
                                        message: err.to_string(),
                                        uri: None,
                                    },
                                    cursor,
                                },
                                Ok(post) => match runtime.evaluate_with_metadata(&post).await {
                                    Ok(outcome) if outcome.ok => StageOutcome::Accepted {
                                        post: Box::new(post),
                                        cursor,
                                    },
                                    Ok(_) => StageOutcome::Rejected { cursor },
                                    Err(err) => StageOutcome::Failed {
                                        error: SyncItemError {
                                            stage: SyncStage::Filter,
                                            message: err.to_string(),
                                            uri: Some(post.uri.to_string()),
                                        },
                                        cursor,
                                    },
                                },
                            }
                        }
                    }
                }
            })
            .buffered(concurrency);

        let mut batch: Vec<(Post, EventMeta)> = Vec::with_capacity(self.settings.batch_size);
        // Cursor of the newest item in the pending batch; promoted to the
        // state cursor only once the batch commits.
        let mut batch_cursor: Option<String> = None;
        let mut items_since_checkpoint = 0u64;
        let mut last_checkpoint_at = Instant::now();
        let mut cancelled = false;
        let mut fatal: Option<SyncError> = None;

        let mut cancel = cancel;
        let cancel_fut = async move {
            loop {
                if *cancel.borrow() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    // Sender gone: cancellation can never fire.
                    futures::future::pending::<()>().await;
                }
            }
        };
        tokio::pin!(cancel_fut);

        loop {
            let outcome = tokio::select! {
                _ = &mut cancel_fut => {
                    cancelled = true;
                    break;
                }
                outcome = staged.next() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            match outcome {
                StageOutcome::SourceFailed { error } => {
                    fatal = Some(SyncError::Source { source: error });
                    break;
                }
                StageOutcome::Failed { error, cursor } => {
                    let error_count = {
                        let mut state = state.lock().expect("Locking failed");
                        state.processed += 1;
                        state.errors.push(error);
                        if batch.is_empty() {
                            state.cursor = cursor.or(state.cursor.take());
                        } else {
                            batch_cursor = cursor.or(batch_cursor.take());
                        }
                        state.errors.len()
                    };
                    if self.settings.max_errors < error_count {
                        fatal = Some(SyncError::TooManyErrors { count: error_count });
                        break;
                    }
                }
                StageOutcome::Rejected { cursor } => {
                    let mut state = state.lock().expect("Locking failed");
                    state.processed += 1;
                    state.skipped += 1;
                    if batch.is_empty() {
                        state.cursor = cursor.or(state.cursor.take());
                    } else {
                        batch_cursor = cursor.or(batch_cursor.take());
                    }
                }
                StageOutcome::Accepted { post, cursor } => {
                    state.lock().expect("Locking failed").processed += 1;
                    let meta = EventMeta {
                        source: source.kind(),
                        command: command.clone(),
                        filter_expr_hash: Some(hash),
                        created_at: Timestamp::now(),
                    };
                    batch.push((*post, meta));
                    batch_cursor = cursor.or(batch_cursor.take());
                    if self.settings.batch_size <= batch.len() {
                        if let Err(err) = self
                            .commit_batch(
                                store,
                                options.policy,
                                &mut batch,
                                &mut batch_cursor,
                                &state,
                            )
                            .await
                        {
                            fatal = Some(err);
                            break;
                        }
                    }
                }
            }

            items_since_checkpoint += 1;
            let interval_hit = Duration::from_millis(self.settings.checkpoint_interval_ms)
                <= last_checkpoint_at.elapsed();
            if (self.settings.checkpoint_every <= items_since_checkpoint || interval_hit)
                && batch.is_empty()
            {
                self.flush_checkpoint(store, source, hash, &state).await?;
                items_since_checkpoint = 0;
                last_checkpoint_at = Instant::now();
            }
        }

        if !cancelled && fatal.is_none() {
            // Natural end of stream: commit the tail batch.
            if let Err(err) = self
                .commit_batch(store, options.policy, &mut batch, &mut batch_cursor, &state)
                .await
            {
                fatal = Some(err);
            }
        }
        // On cancellation the pending batch is discarded whole; the cursor
        // still points at the last committed boundary.
        drop(batch);

        self.flush_checkpoint(store, source, hash, &state).await?;

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn commit_batch(
        &self,
        store: &Arc<StoreDb>,
        policy: CommitPolicy,
        batch: &mut Vec<(Post, EventMeta)>,
        batch_cursor: &mut Option<String>,
        state: &SharedState,
    ) -> Result<(), SyncError> {
        if batch.is_empty() {
            return Ok(());
        }
        match policy {
            CommitPolicy::Refresh => {
                let entries = store.append_upserts(batch).await?;
                let mut state = state.lock().expect("Locking failed");
                state.added += entries.len() as u64;
                if let Some(last) = entries.last() {
                    state.last_seq = Some(last.seq);
                }
            }
            CommitPolicy::Dedupe => {
                let entries = store.append_upserts_if_missing(batch).await?;
                let mut state = state.lock().expect("Locking failed");
                for entry in entries {
                    match entry {
                        Some(entry) => {
                            state.added += 1;
                            state.last_seq = Some(entry.seq);
                        }
                        None => state.skipped += 1,
                    }
                }
            }
        }
        batch.clear();
        if let Some(cursor) = batch_cursor.take() {
            state.lock().expect("Locking failed").cursor = Some(cursor);
        }
        Ok(())
    }

    async fn flush_checkpoint(
        &self,
        store: &Arc<StoreDb>,
        source: &DataSource,
        hash: FilterHash,
        state: &SharedState,
    ) -> Result<(), SyncError> {
        let checkpoint = {
            let state = state.lock().expect("Locking failed");
            SyncCheckpoint {
                source: source.clone(),
                cursor: state.cursor.clone(),
                last_event_seq: state.last_seq,
                filter_hash: Some(hash),
                updated_at: Timestamp::now(),
            }
        };
        store.save_sync_checkpoint(&checkpoint).await?;
        debug!(
            target: LOG_TARGET,
            cursor = ?checkpoint.cursor,
            last_seq = ?checkpoint.last_event_seq,
            "Checkpoint saved"
        );
        Ok(())
    }
}

async fn open_source_stream(
    feed: &dyn FeedSource,
    source: &DataSource,
    cursor: Option<String>,
    page_limit: u32,
) -> Result<RawPostStream, BskyError> {
    let opts = FeedOptions {
        cursor,
        limit: Some(page_limit),
        filter: None,
        include_pins: false,
    };
    match source {
        DataSource::Timeline => feed.get_timeline(opts).await,
        DataSource::Feed { uri } => feed.get_feed(uri, opts).await,
        DataSource::List { uri } => feed.get_list_feed(uri, opts).await,
        DataSource::Notifications => feed.get_notifications(opts).await,
        DataSource::Author {
            actor,
            filter,
            include_pins,
        } => {
            let opts = FeedOptions {
                filter: *filter,
                include_pins: include_pins.unwrap_or(false),
                ..opts
            };
            feed.get_author_feed(actor, opts).await
        }
        DataSource::Thread {
            uri,
            depth,
            parent_height,
        } => {
            let items = feed.get_post_thread(uri, *depth, *parent_height).await?;
            Ok(Box::pin(futures::stream::iter(items.into_iter().map(Ok))))
        }
        DataSource::Jetstream { .. } => Err(BskyError::Feed {
            message: "jetstream sources use the firehose pipeline".to_owned(),
        }),
    }
}

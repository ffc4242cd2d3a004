//! Firehose sub-pipeline.
//!
//! Jetstream delivers commit operations, not feed views: `create`/`update`
//! become upserts (created posts dedupe by default), `delete` becomes a
//! delete when the store holds the URI. The checkpoint cursor is the
//! `time_us` of the last handled message, advanced after each commit so a
//! resume never skips unfinished work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use skysift_core::event::EventMeta;
use skysift_core::id::Handle;
use skysift_core::source::DataSource;
use skysift_core::time::Timestamp;
use skysift_filter::FilterRuntime;
use skysift_store::{StoreDb, SyncCheckpoint};
use snafu::ResultExt as _;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::engine::{spawn_heartbeat, CommitPolicy, SyncEngine, SyncResult, SyncState};
use crate::error::{BskyError, SourceSnafu, SyncError, SyncItemError, SyncStage};
use crate::feed::{CommitMessage, CommitOperation, JetstreamOptions};
use crate::parse::parse_bare_record;
use crate::LOG_TARGET;

const POST_COLLECTION: &str = "app.bsky.feed.post";

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    engine: &SyncEngine,
    store: &Arc<StoreDb>,
    source: &DataSource,
    runtime: Arc<FilterRuntime>,
    checkpoint: Option<SyncCheckpoint>,
    options: &crate::engine::SyncOptions,
    cancel: watch::Receiver<bool>,
) -> Result<SyncResult, SyncError> {
    let DataSource::Jetstream {
        endpoint,
        collections,
        dids,
        compress,
        max_message_size_bytes,
    } = source
    else {
        return Err(SyncError::Source {
            source: BskyError::Firehose {
                message: "not a jetstream source".to_owned(),
            },
        });
    };

    let hash = runtime.filter().hash();
    let command = format!("sync {} {}", source.source_key(), store.name());
    let opts = JetstreamOptions {
        endpoint: endpoint.clone(),
        collections: collections.clone(),
        dids: dids.clone(),
        compress: *compress,
        max_message_size_bytes: *max_message_size_bytes,
        cursor: checkpoint.as_ref().and_then(|c| c.cursor.clone()),
    };
    let mut stream = engine.feed.jetstream(opts).await.context(SourceSnafu)?;

    let state = SyncState::new(checkpoint.as_ref());
    let (heartbeat_stop, heartbeat) = spawn_heartbeat(
        state.clone(),
        engine.reporter.clone(),
        engine.settings.heartbeat_interval_ms,
    );

    let wanted_collections: Vec<String> = collections
        .clone()
        .unwrap_or_else(|| vec![POST_COLLECTION.to_owned()]);

    let limit = options.limit.unwrap_or(u64::MAX);
    let mut handled = 0u64;
    let mut items_since_checkpoint = 0u64;
    let mut last_checkpoint_at = Instant::now();
    let mut fatal: Option<SyncError> = None;

    let mut cancel = cancel;
    let cancel_fut = async move {
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    };
    tokio::pin!(cancel_fut);

    while handled < limit {
        let message = tokio::select! {
            _ = &mut cancel_fut => break,
            message = stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        handled += 1;

        match message {
            Err(err @ BskyError::FirehoseDecode { .. }) => {
                if engine.settings.strict {
                    fatal = Some(SyncError::Source { source: err });
                    break;
                }
                let error_count = {
                    let mut state = state.lock().expect("Locking failed");
                    state.errors.push(SyncItemError {
                        stage: SyncStage::Source,
                        message: err.to_string(),
                        uri: None,
                    });
                    state.errors.len()
                };
                if engine.settings.max_errors < error_count {
                    fatal = Some(SyncError::TooManyErrors { count: error_count });
                    break;
                }
            }
            Err(err) => {
                fatal = Some(SyncError::Source { source: err });
                break;
            }
            Ok(message) => {
                if let Err(err) =
                    handle_message(engine, store, &runtime, options.policy, &command, hash, &state, message, &wanted_collections)
                        .await
                {
                    fatal = Some(err);
                    break;
                }
            }
        }

        items_since_checkpoint += 1;
        let interval_hit = Duration::from_millis(engine.settings.checkpoint_interval_ms)
            <= last_checkpoint_at.elapsed();
        if engine.settings.checkpoint_every <= items_since_checkpoint || interval_hit {
            flush(store, source, hash, &state).await?;
            items_since_checkpoint = 0;
            last_checkpoint_at = Instant::now();
        }
    }

    flush(store, source, hash, &state).await?;

    let _ = heartbeat_stop.send(true);
    let _ = heartbeat.await;
    engine
        .reporter
        .report(&state.lock().expect("Locking failed").progress());

    match fatal {
        Some(err) => Err(err),
        None => Ok(SyncState::into_result(state)),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
    engine: &SyncEngine,
    store: &Arc<StoreDb>,
    runtime: &FilterRuntime,
    policy: CommitPolicy,
    command: &str,
    hash: skysift_core::filter::FilterHash,
    state: &crate::engine::SharedState,
    message: CommitMessage,
    wanted_collections: &[String],
) -> Result<(), SyncError> {
    let cursor = message.time_us.to_string();

    if !wanted_collections
        .iter()
        .any(|c| c == &message.commit.collection)
    {
        let mut state = state.lock().expect("Locking failed");
        state.processed += 1;
        state.skipped += 1;
        state.cursor = Some(cursor);
        return Ok(());
    }

    let uri = match message.uri() {
        Ok(uri) => uri,
        Err(err) => {
            let mut state = state.lock().expect("Locking failed");
            state.processed += 1;
            state.errors.push(SyncItemError {
                stage: SyncStage::Parse,
                message: err.to_string(),
                uri: None,
            });
            state.cursor = Some(cursor);
            return Ok(());
        }
    };

    let meta = EventMeta {
        source: skysift_core::event::SourceKind::Jetstream,
        command: command.to_owned(),
        filter_expr_hash: Some(hash),
        created_at: Timestamp::now(),
    };

    match message.commit.operation {
        CommitOperation::Delete => {
            // Only propagate deletes for posts we actually hold; the
            // firehose deletes everything ever posted.
            if store.contains(&uri).await? {
                let entry = store.append_delete(&uri, &meta).await?;
                let mut state = state.lock().expect("Locking failed");
                state.processed += 1;
                state.deleted += 1;
                state.last_seq = Some(entry.seq);
            } else {
                let mut state = state.lock().expect("Locking failed");
                state.processed += 1;
                state.skipped += 1;
            }
        }
        CommitOperation::Create | CommitOperation::Update => {
            let Some(record) = message.commit.record.as_ref() else {
                let mut state = state.lock().expect("Locking failed");
                state.processed += 1;
                state.errors.push(SyncItemError {
                    stage: SyncStage::Parse,
                    message: "commit op carries no record".to_owned(),
                    uri: Some(uri.to_string()),
                });
                state.cursor = Some(cursor);
                return Ok(());
            };
            let cid = message
                .commit
                .cid
                .clone()
                .unwrap_or_else(|| "uninitializedcid0".parse().expect("valid placeholder"));

            let author = resolve_author(engine, &message).await;
            let post = match parse_bare_record(uri, cid, author, message.did.clone(), record) {
                Ok(post) => post,
                Err(err) => {
                    let mut state = state.lock().expect("Locking failed");
                    state.processed += 1;
                    state.errors.push(SyncItemError {
                        stage: SyncStage::Parse,
                        message: err.to_string(),
                        uri: None,
                    });
                    state.cursor = Some(cursor);
                    return Ok(());
                }
            };

            match runtime.evaluate_with_metadata(&post).await {
                Ok(outcome) if outcome.ok => {
                    let dedupe = matches!(message.commit.operation, CommitOperation::Create)
                        && policy == CommitPolicy::Dedupe;
                    let entry = if dedupe {
                        store.append_upsert_if_missing(&post, &meta).await?
                    } else {
                        store.append_upsert(&post, &meta).await.map(Some)?
                    };
                    let mut state = state.lock().expect("Locking failed");
                    state.processed += 1;
                    match entry {
                        Some(entry) => {
                            state.added += 1;
                            state.last_seq = Some(entry.seq);
                        }
                        None => state.skipped += 1,
                    }
                }
                Ok(_) => {
                    let mut state = state.lock().expect("Locking failed");
                    state.processed += 1;
                    state.skipped += 1;
                }
                Err(err) => {
                    let mut state = state.lock().expect("Locking failed");
                    state.processed += 1;
                    state.errors.push(SyncItemError {
                        stage: SyncStage::Filter,
                        message: err.to_string(),
                        uri: Some(post.uri.to_string()),
                    });
                }
            }
        }
    }

    // Committed (or consciously skipped): the cursor may advance.
    state.lock().expect("Locking failed").cursor = Some(cursor);
    trace!(target: LOG_TARGET, time_us = message.time_us, "Handled firehose message");
    Ok(())
}

/// The firehose carries DIDs only. Resolve a handle when a resolver is
/// wired in, otherwise fall back to the standard placeholder.
async fn resolve_author(engine: &SyncEngine, message: &CommitMessage) -> Handle {
    if let Some(resolver) = &engine.resolver {
        match resolver.resolve_handle(&message.did).await {
            Ok(handle) => return handle,
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    did = %message.did,
                    err = %err,
                    "Handle resolution failed; storing placeholder"
                );
            }
        }
    }
    "handle.invalid".parse().expect("valid placeholder")
}

async fn flush(
    store: &Arc<StoreDb>,
    source: &DataSource,
    hash: skysift_core::filter::FilterHash,
    state: &crate::engine::SharedState,
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
    Ok(())
}

//! Derivation: replay a source store's log through a filter into a target.
//!
//! A derived store is wholly determined by `(source log, filter)`. The
//! checkpoint records the last source seq replayed, so re-derivation is
//! incremental while the filter hash matches and a full, clean replay when it
//! doesn't. Upserts that stop matching turn into deletes in the target; that
//! is what keeps a derived store convergent with its definition.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use skysift_core::event::{EventMeta, PostEvent, SourceKind};
use skysift_core::filter::FilterExpr;
use skysift_core::id::StoreName;
use skysift_core::time::Timestamp;
use skysift_filter::{compile, FilterRuntime, Oracles};
use skysift_store::{
    CatalogError, DerivationCheckpoint, EvaluationMode, StoreConfig, StoreLineage, StoreRegistry,
};
use tracing::{debug, info, instrument};

use crate::error::{EventTimeEffectfulSnafu, SyncError};
use crate::LOG_TARGET;

/// Source log entries replayed per read.
const REPLAY_PAGE: usize = 500;
/// Checkpoint cadence during replay.
const CHECKPOINT_EVERY: u64 = 500;

#[derive(Debug, Clone)]
pub struct DeriveOptions {
    /// Checkpoint identity; defaults to the target store name.
    pub view_name: Option<String>,
    pub evaluation_mode: EvaluationMode,
    /// Register-and-open the target if it doesn't exist yet. This is the
    /// only auto-create in the system; everything else requires the store
    /// to exist.
    pub create_target: bool,
}

#[bon::bon]
impl DeriveOptions {
    #[builder]
    pub fn new(
        view_name: Option<String>,
        evaluation_mode: Option<EvaluationMode>,
        create_target: Option<bool>,
    ) -> Self {
        Self {
            view_name,
            evaluation_mode: evaluation_mode.unwrap_or(EvaluationMode::DeriveTime),
            create_target: create_target.unwrap_or(false),
        }
    }
}

impl Default for DeriveOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationResult {
    pub events_processed: u64,
    pub events_matched: u64,
    pub events_skipped: u64,
    pub deletes_propagated: u64,
    pub duration_ms: u64,
}

pub struct DerivationEngine {
    registry: Arc<StoreRegistry>,
    oracles: Oracles,
}

#[bon::bon]
impl DerivationEngine {
    #[builder]
    pub fn new(registry: Arc<StoreRegistry>, oracles: Option<Oracles>) -> Self {
        Self {
            registry,
            oracles: oracles.unwrap_or_default(),
        }
    }
}

impl DerivationEngine {
    /// Replays `source` through `filter` into `target`.
    #[instrument(name = "derive", skip_all, fields(source = %source, target = %target))]
    pub async fn derive(
        &self,
        source: &StoreName,
        target: &StoreName,
        filter: &FilterExpr,
        options: DeriveOptions,
    ) -> Result<DerivationResult, SyncError> {
        let compiled = compile(filter)?;
        if options.evaluation_mode == EvaluationMode::EventTime && compiled.is_effectful() {
            return EventTimeEffectfulSnafu.fail();
        }
        let hash = compiled.hash();

        let source_db = self.registry.open(source).await?;
        let target_db = if options.create_target {
            let config = StoreConfig {
                lineage: Some(StoreLineage {
                    source_store: source.clone(),
                    filter: filter.clone(),
                    evaluation_mode: options.evaluation_mode,
                }),
            };
            self.registry.create(target, None, config).await?
        } else {
            self.registry.open(target).await?
        };

        // EventTime replay must stay deterministic from the log alone, so it
        // never sees the oracle set.
        let oracles = match options.evaluation_mode {
            EvaluationMode::EventTime => Oracles::none(),
            EvaluationMode::DeriveTime => self.oracles.clone(),
        };
        let runtime = FilterRuntime::new(compiled, oracles);

        let view_name = options
            .view_name
            .unwrap_or_else(|| target.as_str().to_owned());
        let resumable = target_db
            .load_derivation_checkpoint(&view_name)
            .await?
            .filter(|cp| {
                cp.filter_hash == hash
                    && cp.source_store == *source
                    && cp.target_store == *target
                    && cp.evaluation_mode == options.evaluation_mode
            });

        let mut checkpoint = match resumable {
            Some(cp) => {
                debug!(
                    target: LOG_TARGET,
                    last_seq = ?cp.last_source_event_seq,
                    "Resuming derivation from checkpoint"
                );
                cp
            }
            None => {
                // Filter or endpoints changed: the target contents are no
                // longer explainable, start clean.
                target_db.clear_for_rederivation().await?;
                DerivationCheckpoint {
                    view_name: view_name.clone(),
                    source_store: source.clone(),
                    target_store: target.clone(),
                    filter_hash: hash,
                    evaluation_mode: options.evaluation_mode,
                    last_source_event_seq: None,
                    events_processed: 0,
                    events_matched: 0,
                    deletes_propagated: 0,
                    updated_at: Timestamp::now(),
                }
            }
        };

        let command = format!("derive {source} {target}");
        let started = Instant::now();
        let mut result = DerivationResult::default();
        let mut after = checkpoint.last_source_event_seq;
        let mut since_checkpoint = 0u64;

        loop {
            let entries = source_db.read_log(after, REPLAY_PAGE).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                after = Some(entry.seq);
                let meta = EventMeta {
                    source: SourceKind::Derivation,
                    command: command.clone(),
                    filter_expr_hash: Some(hash),
                    created_at: Timestamp::now(),
                };
                match entry.event {
                    PostEvent::PostUpsert { post, .. } => {
                        let accepted = runtime
                            .evaluate(&post)
                            .await
                            .map_err(|source| SyncError::Eval { source })?;
                        if accepted {
                            target_db.append_upsert_if_missing(&post, &meta).await?;
                            result.events_matched += 1;
                            checkpoint.events_matched += 1;
                        } else if target_db.contains(&post.uri).await? {
                            // Was accepted under an earlier version of the
                            // post; it no longer matches, so it leaves.
                            target_db.append_delete(&post.uri, &meta).await?;
                            result.deletes_propagated += 1;
                            checkpoint.deletes_propagated += 1;
                        } else {
                            result.events_skipped += 1;
                        }
                    }
                    PostEvent::PostDelete { uri, .. } => {
                        target_db.append_delete(&uri, &meta).await?;
                        result.deletes_propagated += 1;
                        checkpoint.deletes_propagated += 1;
                    }
                }
                result.events_processed += 1;
                checkpoint.events_processed += 1;
                since_checkpoint += 1;

                if CHECKPOINT_EVERY <= since_checkpoint {
                    checkpoint.last_source_event_seq = after;
                    checkpoint.updated_at = Timestamp::now();
                    target_db.save_derivation_checkpoint(&checkpoint).await?;
                    since_checkpoint = 0;
                }
            }
        }

        checkpoint.last_source_event_seq = after;
        checkpoint.updated_at = Timestamp::now();
        target_db.save_derivation_checkpoint(&checkpoint).await?;

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            target: LOG_TARGET,
            processed = result.events_processed,
            matched = result.events_matched,
            deletes = result.deletes_propagated,
            duration_ms = result.duration_ms,
            "Derivation complete"
        );
        Ok(result)
    }

    /// True when the source log has advanced past the view's checkpoint.
    ///
    /// No checkpoint → stale. No source store → not stale (there is nothing
    /// to derive from).
    pub async fn is_stale(
        &self,
        view_name: &str,
        source: &StoreName,
        target: &StoreName,
    ) -> Result<bool, SyncError> {
        let source_db = match self.registry.open(source).await {
            Ok(db) => db,
            Err(CatalogError::StoreNotFound { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let target_db = match self.registry.open(target).await {
            Ok(db) => db,
            Err(CatalogError::StoreNotFound { .. }) => return Ok(true),
            Err(err) => return Err(err.into()),
        };

        let Some(checkpoint) = target_db.load_derivation_checkpoint(view_name).await? else {
            return Ok(true);
        };
        let source_max = source_db.max_event_seq().await?.map_or(0, |s| s.0);
        let replayed = checkpoint.last_source_event_seq.map_or(0, |s| s.0);
        Ok(replayed < source_max)
    }
}

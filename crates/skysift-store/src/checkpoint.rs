//! Sync and derivation checkpoints.
//!
//! Both live in the store database so a checkpoint update can share the
//! transaction of the batch it describes; a checkpoint is never ahead of the
//! events it covers.

use rusqlite::{params, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use skysift_core::event::EventSeq;
use skysift_core::filter::FilterHash;
use skysift_core::id::StoreName;
use skysift_core::source::DataSource;
use skysift_core::time::Timestamp;
use snafu::ResultExt as _;
use tracing::debug;

use crate::{CorruptRowSnafu, StoreDb, StoreIoResult, StoredJsonSnafu, WriteTxCtx, LOG_TARGET};

/// Resumable position of one `(store, source)` sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub source: DataSource,
    pub cursor: Option<String>,
    pub last_event_seq: Option<EventSeq>,
    pub filter_hash: Option<FilterHash>,
    pub updated_at: Timestamp,
}

/// Whether a derived store may call oracles during replay.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationMode {
    /// Pure filters only; replay is deterministic from the log alone.
    EventTime,
    /// Filters may consult oracles at derivation time.
    DeriveTime,
}

impl EvaluationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationMode::EventTime => "eventTime",
            EvaluationMode::DeriveTime => "deriveTime",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "eventTime" => Some(EvaluationMode::EventTime),
            "deriveTime" => Some(EvaluationMode::DeriveTime),
            _ => None,
        }
    }
}

/// Progress of a derived view, stored in the target store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationCheckpoint {
    pub view_name: String,
    pub source_store: StoreName,
    pub target_store: StoreName,
    pub filter_hash: FilterHash,
    pub evaluation_mode: EvaluationMode,
    pub last_source_event_seq: Option<EventSeq>,
    pub events_processed: u64,
    pub events_matched: u64,
    pub deletes_propagated: u64,
    pub updated_at: Timestamp,
}

impl StoreDb {
    /// Loads the checkpoint for `source`, or `None` when there is none or it
    /// was written under a different filter (a changed filter rescans from
    /// the source's natural start).
    pub async fn load_sync_checkpoint(
        &self,
        source: &DataSource,
        filter_hash: &FilterHash,
    ) -> StoreIoResult<Option<SyncCheckpoint>> {
        let key = source.source_key();
        let loaded = self
            .read_with(|conn| {
                conn.query_row(
                    "SELECT source_json, cursor, last_event_seq, filter_hash, updated_at
                     FROM sync_checkpoints WHERE source_key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(Into::into)
            })
            .await?;

        let Some((source_json, cursor, last_seq, stored_hash, updated_at)) = loaded else {
            return Ok(None);
        };

        let stored_hash = stored_hash
            .map(|h| {
                h.parse::<FilterHash>().map_err(|_| {
                    CorruptRowSnafu {
                        what: format!("filter hash in checkpoint `{key}`"),
                    }
                    .build()
                })
            })
            .transpose()?;
        if stored_hash.as_ref() != Some(filter_hash) {
            debug!(
                target: LOG_TARGET,
                store = %self.name(),
                source = %key,
                "Checkpoint ignored: filter changed"
            );
            return Ok(None);
        }

        Ok(Some(SyncCheckpoint {
            source: serde_json::from_str(&source_json).context(StoredJsonSnafu)?,
            cursor,
            last_event_seq: last_seq.map(|s| EventSeq(s as u64)),
            filter_hash: stored_hash,
            updated_at: updated_at.parse().map_err(|_| {
                CorruptRowSnafu {
                    what: format!("timestamp in checkpoint `{key}`"),
                }
                .build()
            })?,
        }))
    }

    pub async fn save_sync_checkpoint(&self, checkpoint: &SyncCheckpoint) -> StoreIoResult<()> {
        self.write_with(|tx| Self::save_sync_checkpoint_tx(tx, checkpoint))
            .await
    }

    /// Upserts the checkpoint row. `last_event_seq` never regresses: the
    /// stored value is the max of the existing and the new one.
    pub fn save_sync_checkpoint_tx(
        tx: &WriteTxCtx,
        checkpoint: &SyncCheckpoint,
    ) -> StoreIoResult<()> {
        let source_json =
            serde_json::to_string(&checkpoint.source).context(StoredJsonSnafu)?;
        tx.execute(
            "INSERT INTO sync_checkpoints
                 (source_key, source_json, cursor, last_event_seq, filter_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_key) DO UPDATE SET
                 source_json = excluded.source_json,
                 cursor = excluded.cursor,
                 last_event_seq = MAX(COALESCE(sync_checkpoints.last_event_seq, 0),
                                      COALESCE(excluded.last_event_seq, 0)),
                 filter_hash = excluded.filter_hash,
                 updated_at = excluded.updated_at",
            params![
                checkpoint.source.source_key(),
                source_json,
                checkpoint.cursor,
                checkpoint.last_event_seq.map(|s| s.0 as i64),
                checkpoint.filter_hash.map(|h| h.to_string()),
                checkpoint.updated_at.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn load_derivation_checkpoint(
        &self,
        view_name: &str,
    ) -> StoreIoResult<Option<DerivationCheckpoint>> {
        let view_name = view_name.to_owned();
        self.read_with(|conn| {
            conn.query_row(
                "SELECT view_name, source_store, target_store, filter_hash, evaluation_mode,
                        last_source_event_seq, events_processed, events_matched,
                        deletes_propagated, updated_at
                 FROM derivation_checkpoints WHERE view_name = ?1",
                params![view_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?
            .map(|row| decode_derivation_row(row))
            .transpose()
        })
        .await
    }

    pub async fn save_derivation_checkpoint(
        &self,
        checkpoint: &DerivationCheckpoint,
    ) -> StoreIoResult<()> {
        self.write_with(|tx| {
            tx.execute(
                "INSERT INTO derivation_checkpoints
                     (view_name, source_store, target_store, filter_hash, evaluation_mode,
                      last_source_event_seq, events_processed, events_matched,
                      deletes_propagated, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(view_name) DO UPDATE SET
                     source_store = excluded.source_store,
                     target_store = excluded.target_store,
                     filter_hash = excluded.filter_hash,
                     evaluation_mode = excluded.evaluation_mode,
                     last_source_event_seq = excluded.last_source_event_seq,
                     events_processed = excluded.events_processed,
                     events_matched = excluded.events_matched,
                     deletes_propagated = excluded.deletes_propagated,
                     updated_at = excluded.updated_at",
                params![
                    checkpoint.view_name,
                    checkpoint.source_store.as_str(),
                    checkpoint.target_store.as_str(),
                    checkpoint.filter_hash.to_string(),
                    checkpoint.evaluation_mode.as_str(),
                    checkpoint.last_source_event_seq.map(|s| s.0 as i64),
                    checkpoint.events_processed as i64,
                    checkpoint.events_matched as i64,
                    checkpoint.deletes_propagated as i64,
                    checkpoint.updated_at.to_string(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

type DerivationRow = (
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    i64,
    i64,
    i64,
    String,
);

fn decode_derivation_row(row: DerivationRow) -> StoreIoResult<DerivationCheckpoint> {
    let (
        view_name,
        source_store,
        target_store,
        filter_hash,
        evaluation_mode,
        last_seq,
        processed,
        matched,
        deletes,
        updated_at,
    ) = row;
    let corrupt = |what: String| CorruptRowSnafu { what }.build();
    Ok(DerivationCheckpoint {
        source_store: source_store
            .parse()
            .map_err(|_| corrupt(format!("source store in view `{view_name}`")))?,
        target_store: target_store
            .parse()
            .map_err(|_| corrupt(format!("target store in view `{view_name}`")))?,
        filter_hash: filter_hash
            .parse()
            .map_err(|_| corrupt(format!("filter hash in view `{view_name}`")))?,
        evaluation_mode: EvaluationMode::parse(&evaluation_mode)
            .ok_or_else(|| corrupt(format!("evaluation mode in view `{view_name}`")))?,
        last_source_event_seq: last_seq.map(|s| EventSeq(s as u64)),
        events_processed: processed as u64,
        events_matched: matched as u64,
        deletes_propagated: deletes as u64,
        updated_at: updated_at
            .parse()
            .map_err(|_| corrupt(format!("timestamp in view `{view_name}`")))?,
        view_name,
    })
}

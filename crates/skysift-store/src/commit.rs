//! Event append and index maintenance.
//!
//! Every append updates the post index and the event log in one transaction,
//! so invariants hold at commit boundaries: the index always reflects the
//! latest upsert/delete per URI, and `post_hashtag` always equals the
//! hashtags of the stored post JSON.

use std::collections::BTreeSet;

use rusqlite::params;
use skysift_core::event::{EventId, EventLogEntry, EventMeta, EventSeq, PostEvent,
    EVENT_SCHEMA_VERSION};
use skysift_core::id::{Hashtag, PostUri};
use skysift_core::post::Post;
use snafu::ResultExt as _;
use tracing::info;

use crate::{CorruptRowSnafu, StoreDb, StoreIoResult, StoredJsonSnafu, WriteTxCtx, LOG_TARGET};

/// Result of [`StoreDb::verify_invariants`].
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub posts: u64,
    pub events: u64,
    pub violations: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

impl StoreDb {
    pub async fn append_upsert(
        &self,
        post: &Post,
        meta: &EventMeta,
    ) -> StoreIoResult<EventLogEntry> {
        self.write_with(|tx| Self::upsert_tx(tx, post, meta)).await
    }

    /// Dedupe variant: `None` when the URI is already present in the index.
    pub async fn append_upsert_if_missing(
        &self,
        post: &Post,
        meta: &EventMeta,
    ) -> StoreIoResult<Option<EventLogEntry>> {
        self.write_with(|tx| Self::upsert_if_missing_tx(tx, post, meta))
            .await
    }

    /// Batch append in a single transaction; one entry per input, in input
    /// order.
    pub async fn append_upserts(
        &self,
        items: &[(Post, EventMeta)],
    ) -> StoreIoResult<Vec<EventLogEntry>> {
        self.write_with(|tx| {
            items
                .iter()
                .map(|(post, meta)| Self::upsert_tx(tx, post, meta))
                .collect()
        })
        .await
    }

    /// Batch dedupe variant, single transaction, input order preserved.
    pub async fn append_upserts_if_missing(
        &self,
        items: &[(Post, EventMeta)],
    ) -> StoreIoResult<Vec<Option<EventLogEntry>>> {
        self.write_with(|tx| {
            items
                .iter()
                .map(|(post, meta)| Self::upsert_if_missing_tx(tx, post, meta))
                .collect()
        })
        .await
    }

    /// Records a delete. The index row may or may not exist; the log entry is
    /// appended either way.
    pub async fn append_delete(
        &self,
        uri: &PostUri,
        meta: &EventMeta,
    ) -> StoreIoResult<EventLogEntry> {
        self.write_with(|tx| Self::delete_tx(tx, uri, meta)).await
    }

    pub async fn count(&self) -> StoreIoResult<u64> {
        self.read_with(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get::<_, i64>(0))? as u64)
        })
        .await
    }

    pub async fn max_event_seq(&self) -> StoreIoResult<Option<EventSeq>> {
        self.read_with(|conn| Self::max_event_seq_conn(conn)).await
    }

    pub async fn contains(&self, uri: &PostUri) -> StoreIoResult<bool> {
        self.read_with(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM posts WHERE uri = ?1)",
                params![uri.as_str()],
                |row| row.get::<_, bool>(0),
            )?)
        })
        .await
    }

    pub async fn get_post(&self, uri: &PostUri) -> StoreIoResult<Option<Post>> {
        self.read_with(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT post_json FROM posts WHERE uri = ?1",
                    params![uri.as_str()],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            json.map(|json| serde_json::from_str(&json).context(StoredJsonSnafu))
                .transpose()
        })
        .await
    }

    /// Typed slice of the log: entries with `seq > after`, oldest first.
    pub async fn read_log(
        &self,
        after: Option<EventSeq>,
        limit: usize,
    ) -> StoreIoResult<Vec<EventLogEntry>> {
        self.read_with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, id, version, event_json FROM event_log
                 WHERE ?1 < seq ORDER BY seq ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![after.map_or(0, |s| s.0) as i64, limit as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )?;
            rows.map(|row| {
                let (seq, id, version, event_json) = row?;
                decode_log_row(seq, &id, version, &event_json)
            })
            .collect()
        })
        .await
    }

    /// Replays one event into the index without touching the log. Used for
    /// index rebuilds; regular appends go through the `append_*` family.
    pub async fn apply(&self, event: &PostEvent) -> StoreIoResult<()> {
        self.write_with(|tx| Self::apply_index_tx(tx, event)).await
    }

    /// Drops the index and reconstructs it from the log. Returns the number
    /// of events replayed.
    pub async fn rebuild_index(&self) -> StoreIoResult<u64> {
        let replayed = self
            .write_with(|tx| {
                // post_hashtag rows go with their posts via the FK cascade.
                tx.execute("DELETE FROM posts", [])?;

                let mut stmt =
                    tx.prepare("SELECT seq, id, version, event_json FROM event_log ORDER BY seq")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;

                let mut replayed = 0u64;
                for row in rows {
                    let (seq, id, version, event_json) = row?;
                    let entry = decode_log_row(seq, &id, version, &event_json)?;
                    Self::apply_index_tx(tx, &entry.event)?;
                    replayed += 1;
                }
                Ok(replayed)
            })
            .await?;
        info!(target: LOG_TARGET, store = %self.name(), %replayed, "Rebuilt post index from log");
        Ok(replayed)
    }

    /// Empties the index and the log and resets seq numbering. Only for
    /// derived stores about to be replayed from scratch; a regular store's
    /// log is append-only.
    pub async fn clear_for_rederivation(&self) -> StoreIoResult<()> {
        self.write_with(|tx| {
            tx.execute("DELETE FROM posts", [])?;
            tx.execute("DELETE FROM event_log", [])?;
            tx.execute("DELETE FROM sqlite_sequence WHERE name = 'event_log'", [])?;
            Ok(())
        })
        .await
    }

    /// Checks the invariants the committer maintains. Meant
    /// for debugging and tests; scans the whole store.
    pub async fn verify_invariants(&self) -> StoreIoResult<IntegrityReport> {
        self.read_with(|conn| {
            let mut report = IntegrityReport {
                posts: conn.query_row("SELECT COUNT(*) FROM posts", [], |r| r.get::<_, i64>(0))?
                    as u64,
                events: conn.query_row("SELECT COUNT(*) FROM event_log", [], |r| {
                    r.get::<_, i64>(0)
                })? as u64,
                violations: Vec::new(),
            };

            // (c) seq dense and starting at 1
            if 0 < report.events {
                let (min, max): (i64, i64) = conn.query_row(
                    "SELECT MIN(seq), MAX(seq) FROM event_log",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                if min != 1 || max as u64 != report.events {
                    report
                        .violations
                        .push(format!("event seq not dense: min={min} max={max}"));
                }
            }

            // (a) index rows match the latest event per uri, both directions
            let live_by_log: u64 = conn.query_row(
                "SELECT COUNT(*) FROM (
                     SELECT e.uri FROM event_log e
                     JOIN (SELECT uri, MAX(seq) AS ms FROM event_log GROUP BY uri) latest
                       ON e.uri = latest.uri AND e.seq = latest.ms
                     WHERE e.kind = 'upsert')",
                [],
                |r| r.get::<_, i64>(0),
            )? as u64;
            if live_by_log != report.posts {
                report.violations.push(format!(
                    "index has {} rows but the log implies {}",
                    report.posts, live_by_log
                ));
            }
            let mut orphan_stmt = conn.prepare(
                "SELECT p.uri FROM posts p
                 LEFT JOIN (SELECT uri, MAX(seq) AS ms FROM event_log GROUP BY uri) latest
                   ON latest.uri = p.uri
                 LEFT JOIN event_log e ON e.uri = latest.uri AND e.seq = latest.ms
                 WHERE e.kind IS NULL OR e.kind != 'upsert'",
            )?;
            let orphans = orphan_stmt.query_map([], |r| r.get::<_, String>(0))?;
            for uri in orphans {
                report
                    .violations
                    .push(format!("index row without live upsert: {}", uri?));
            }

            // (b) hashtag table equals the stored JSON's hashtags
            let mut posts_stmt = conn.prepare("SELECT uri, post_json FROM posts")?;
            let posts = posts_stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            for row in posts {
                let (uri, json) = row?;
                let post: Post = serde_json::from_str(&json).context(StoredJsonSnafu)?;
                let mut indexed: BTreeSet<Hashtag> = BTreeSet::new();
                let mut tag_stmt =
                    conn.prepare("SELECT tag FROM post_hashtag WHERE uri = ?1")?;
                let tags = tag_stmt.query_map(params![uri], |r| r.get::<_, String>(0))?;
                for tag in tags {
                    let tag = tag?;
                    indexed.insert(tag.parse().map_err(|_| {
                        CorruptRowSnafu {
                            what: format!("unparseable hashtag for {uri}"),
                        }
                        .build()
                    })?);
                }
                if indexed != post.hashtags {
                    report
                        .violations
                        .push(format!("hashtag rows out of sync for {uri}"));
                }
            }

            Ok(report)
        })
        .await
    }

    pub(crate) fn max_event_seq_conn(conn: &rusqlite::Connection) -> StoreIoResult<Option<EventSeq>> {
        let max: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM event_log", [], |row| row.get(0))?;
        Ok(max.map(|s| EventSeq(s as u64)))
    }

    pub fn upsert_tx(
        tx: &WriteTxCtx,
        post: &Post,
        meta: &EventMeta,
    ) -> StoreIoResult<EventLogEntry> {
        Self::write_index_row_tx(tx, post)?;
        Self::replace_hashtags_tx(tx, &post.uri, &post.hashtags)?;
        Self::append_event_tx(
            tx,
            PostEvent::PostUpsert {
                post: post.clone(),
                meta: meta.clone(),
            },
        )
    }

    pub fn upsert_if_missing_tx(
        tx: &WriteTxCtx,
        post: &Post,
        meta: &EventMeta,
    ) -> StoreIoResult<Option<EventLogEntry>> {
        let post_json = serde_json::to_string(post).context(StoredJsonSnafu)?;
        let inserted = tx.execute(
            "INSERT INTO posts (uri, created_at, created_date, author, post_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uri) DO NOTHING",
            params![
                post.uri.as_str(),
                post.created_at.to_sortable(),
                post.created_at.date_bucket(),
                post.author.as_str(),
                post_json
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Self::replace_hashtags_tx(tx, &post.uri, &post.hashtags)?;
        Self::append_event_tx(
            tx,
            PostEvent::PostUpsert {
                post: post.clone(),
                meta: meta.clone(),
            },
        )
        .map(Some)
    }

    pub fn delete_tx(
        tx: &WriteTxCtx,
        uri: &PostUri,
        meta: &EventMeta,
    ) -> StoreIoResult<EventLogEntry> {
        // FK cascade clears post_hashtag.
        tx.execute("DELETE FROM posts WHERE uri = ?1", params![uri.as_str()])?;
        Self::append_event_tx(
            tx,
            PostEvent::PostDelete {
                uri: uri.clone(),
                meta: meta.clone(),
            },
        )
    }

    fn apply_index_tx(tx: &WriteTxCtx, event: &PostEvent) -> StoreIoResult<()> {
        match event {
            PostEvent::PostUpsert { post, .. } => {
                Self::write_index_row_tx(tx, post)?;
                Self::replace_hashtags_tx(tx, &post.uri, &post.hashtags)?;
            }
            PostEvent::PostDelete { uri, .. } => {
                tx.execute("DELETE FROM posts WHERE uri = ?1", params![uri.as_str()])?;
            }
        }
        Ok(())
    }

    fn write_index_row_tx(tx: &WriteTxCtx, post: &Post) -> StoreIoResult<()> {
        let post_json = serde_json::to_string(post).context(StoredJsonSnafu)?;
        tx.execute(
            "INSERT INTO posts (uri, created_at, created_date, author, post_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uri) DO UPDATE SET
                 created_at = excluded.created_at,
                 created_date = excluded.created_date,
                 author = excluded.author,
                 post_json = excluded.post_json",
            params![
                post.uri.as_str(),
                post.created_at.to_sortable(),
                post.created_at.date_bucket(),
                post.author.as_str(),
                post_json
            ],
        )?;
        Ok(())
    }

    fn replace_hashtags_tx(
        tx: &WriteTxCtx,
        uri: &PostUri,
        hashtags: &BTreeSet<Hashtag>,
    ) -> StoreIoResult<()> {
        tx.execute(
            "DELETE FROM post_hashtag WHERE uri = ?1",
            params![uri.as_str()],
        )?;
        let mut stmt = tx.prepare_cached("INSERT INTO post_hashtag (uri, tag) VALUES (?1, ?2)")?;
        for tag in hashtags {
            stmt.execute(params![uri.as_str(), tag.as_str()])?;
        }
        Ok(())
    }

    fn append_event_tx(tx: &WriteTxCtx, event: PostEvent) -> StoreIoResult<EventLogEntry> {
        let id = EventId::generate();
        let event_json = serde_json::to_string(&event).context(StoredJsonSnafu)?;
        let meta_json = serde_json::to_string(event.meta()).context(StoredJsonSnafu)?;
        tx.execute(
            "INSERT INTO event_log (id, version, kind, uri, meta_json, event_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                EVENT_SCHEMA_VERSION,
                event.kind().as_str(),
                event.uri().as_str(),
                meta_json,
                event_json,
                event.meta().created_at.to_sortable()
            ],
        )?;
        let seq = EventSeq(tx.last_insert_rowid() as u64);
        Ok(EventLogEntry {
            seq,
            id,
            version: EVENT_SCHEMA_VERSION,
            event,
        })
    }
}

pub(crate) fn decode_log_row(
    seq: i64,
    id: &str,
    version: i64,
    event_json: &str,
) -> StoreIoResult<EventLogEntry> {
    let event: PostEvent = serde_json::from_str(event_json).context(StoredJsonSnafu)?;
    Ok(EventLogEntry {
        seq: EventSeq(seq as u64),
        id: id.parse().map_err(|_| {
            CorruptRowSnafu {
                what: format!("bad event id at seq {seq}"),
            }
            .build()
        })?,
        version: version as u32,
        event,
    })
}

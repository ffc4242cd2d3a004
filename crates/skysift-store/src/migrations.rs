//! Embedded schema migrations, tracked via `PRAGMA user_version`.

use rusqlite::Connection;

use crate::{DbVersionTooHighSnafu, StoreIoResult};

/// Per-store database schema.
pub(crate) const STORE_MIGRATIONS: &[&str] = &[
    // v1: event log, post index, checkpoints
    "CREATE TABLE event_log (
         seq INTEGER PRIMARY KEY AUTOINCREMENT,
         id TEXT NOT NULL UNIQUE,
         version INTEGER NOT NULL,
         kind TEXT NOT NULL,
         uri TEXT NOT NULL,
         meta_json TEXT NOT NULL,
         event_json TEXT NOT NULL,
         created_at TEXT NOT NULL
     );
     CREATE INDEX event_log_uri ON event_log(uri);
     CREATE TABLE posts (
         uri TEXT PRIMARY KEY,
         created_at TEXT NOT NULL,
         created_date TEXT NOT NULL,
         author TEXT NOT NULL,
         post_json TEXT NOT NULL
     );
     CREATE INDEX posts_created_at ON posts(created_at, uri);
     CREATE INDEX posts_author ON posts(author);
     CREATE INDEX posts_created_date ON posts(created_date);
     CREATE TABLE post_hashtag (
         uri TEXT NOT NULL REFERENCES posts(uri) ON DELETE CASCADE,
         tag TEXT NOT NULL,
         PRIMARY KEY (uri, tag)
     );
     CREATE INDEX post_hashtag_tag ON post_hashtag(tag);
     CREATE TABLE sync_checkpoints (
         source_key TEXT PRIMARY KEY,
         source_json TEXT NOT NULL,
         cursor TEXT,
         last_event_seq INTEGER,
         filter_hash TEXT,
         updated_at TEXT NOT NULL
     );
     CREATE TABLE derivation_checkpoints (
         view_name TEXT PRIMARY KEY,
         source_store TEXT NOT NULL,
         target_store TEXT NOT NULL,
         filter_hash TEXT NOT NULL,
         evaluation_mode TEXT NOT NULL,
         last_source_event_seq INTEGER,
         events_processed INTEGER NOT NULL DEFAULT 0,
         events_matched INTEGER NOT NULL DEFAULT 0,
         deletes_propagated INTEGER NOT NULL DEFAULT 0,
         updated_at TEXT NOT NULL
     );",
];

/// Global catalog schema.
pub(crate) const CATALOG_MIGRATIONS: &[&str] = &[
    // v1: store registry
    "CREATE TABLE stores (
         name TEXT PRIMARY KEY,
         root TEXT NOT NULL,
         created_at TEXT NOT NULL,
         updated_at TEXT NOT NULL,
         description TEXT,
         config_json TEXT NOT NULL
     );",
];

/// Applies every migration newer than the database's `user_version`.
///
/// A database written by a newer build is refused rather than migrated
/// backwards.
pub(crate) fn run(conn: &mut Connection, migrations: &[&str]) -> StoreIoResult<()> {
    let current: u64 = conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))? as u64;
    let code_ver = migrations.len() as u64;
    if code_ver < current {
        return DbVersionTooHighSnafu {
            db_ver: current,
            code_ver,
        }
        .fail();
    }

    for (idx, sql) in migrations.iter().enumerate().skip(current as usize) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (idx + 1) as i64)?;
        tx.commit()?;
    }
    Ok(())
}

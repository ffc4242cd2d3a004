//! Per-store SQLite database: the event log, the post index derived from it,
//! and the sync/derivation checkpoints.
//!
//! One [`StoreDb`] is the single writer for its store. All writes go through
//! [`StoreDb::write_with`], which serializes on the connection mutex, runs the
//! closure inside a transaction, and fires on-commit hooks only after the
//! transaction lands. Reads use a second connection so queries can proceed
//! while a batch commits (WAL journal mode).

mod catalog;
mod checkpoint;
mod commit;
mod migrations;
mod query;

use std::io;
use std::ops;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::{fs, result};

use rusqlite::Connection;
use skysift_core::id::StoreName;
use snafu::{Location, ResultExt as _, Snafu};
use tracing::debug;

pub use self::catalog::{
    CatalogError, CatalogResult, StoreCatalog, StoreConfig, StoreLineage, StoreMetadata,
    StoreRegistry,
};
pub use self::checkpoint::{DerivationCheckpoint, EvaluationMode, SyncCheckpoint};
pub use self::commit::IntegrityReport;
pub use self::query::{PostStream, QueryError, QueryStats, SortOrder, StoreQuery};

const LOG_TARGET: &str = "skysift::db";

/// Storage-layer failure. Fatal for the batch that hit it.
#[derive(Debug, Snafu)]
pub enum StoreIoError {
    #[snafu(display("failed to open database at {}", path.display()))]
    OpenDb {
        path: PathBuf,
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Sql {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to decode stored JSON"))]
    StoredJson {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("database schema version {db_ver} is newer than supported {code_ver}"))]
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to create {}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("corrupt row: {what}"))]
    CorruptRow {
        what: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type StoreIoResult<T> = result::Result<T, StoreIoError>;

/// Write transaction plus hooks to run after a successful commit.
///
/// Hooks are for in-process notifications only; anything that must be atomic
/// with the batch belongs in the transaction itself.
pub struct WriteTxCtx<'a> {
    tx: rusqlite::Transaction<'a>,
    on_commit: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl<'a> From<rusqlite::Transaction<'a>> for WriteTxCtx<'a> {
    fn from(tx: rusqlite::Transaction<'a>) -> Self {
        Self {
            tx,
            on_commit: Mutex::new(vec![]),
        }
    }
}

impl<'a> ops::Deref for WriteTxCtx<'a> {
    type Target = rusqlite::Transaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl WriteTxCtx<'_> {
    pub fn on_commit(&self, f: impl FnOnce() + Send + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), rusqlite::Error> {
        let Self { tx, on_commit } = self;

        tx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

/// Handle to one store's database.
#[derive(Debug)]
pub struct StoreDb {
    name: StoreName,
    path: PathBuf,
    write_conn: Mutex<Connection>,
    read_conn: Mutex<Connection>,
}

impl StoreDb {
    /// Opens (creating if needed) the store database at `path`.
    ///
    /// The parent directory is created with mode `0o700` and the database
    /// file ends up `0o600`; store contents are private to the user.
    pub async fn open(path: impl Into<PathBuf>, name: StoreName) -> StoreIoResult<StoreDb> {
        let path = path.into();
        debug!(target: LOG_TARGET, store = %name, path = %path.display(), "Opening store database");

        if let Some(parent) = path.parent() {
            create_dir_secure(parent)?;
        }

        tokio::task::block_in_place(|| {
            let mut write_conn = open_conn(&path)?;
            migrations::run(&mut write_conn, migrations::STORE_MIGRATIONS)?;
            restrict_file_mode(&path);
            let read_conn = open_conn(&path)?;
            Ok(StoreDb {
                name,
                path,
                write_conn: Mutex::new(write_conn),
                read_conn: Mutex::new(read_conn),
            })
        })
    }

    pub fn name(&self) -> &StoreName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` inside a write transaction, serialized against every other
    /// writer of this store. On-commit hooks fire after the commit.
    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&WriteTxCtx) -> StoreIoResult<T>,
    ) -> StoreIoResult<T> {
        tokio::task::block_in_place(|| {
            let mut conn = self.write_conn.lock().expect("Locking failed");
            let tx = conn.transaction()?;
            let ctx = WriteTxCtx::from(tx);
            let res = f(&ctx)?;
            ctx.commit()?;
            Ok(res)
        })
    }

    /// Runs `f` on the read connection. Readers don't block the writer.
    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreIoResult<T>,
    ) -> StoreIoResult<T> {
        tokio::task::block_in_place(|| {
            let conn = self.read_conn.lock().expect("Locking failed");
            f(&conn)
        })
    }
}

fn open_conn(path: &Path) -> StoreIoResult<Connection> {
    let conn = Connection::open(path).context(OpenDbSnafu {
        path: path.to_path_buf(),
    })?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\n\
         PRAGMA synchronous=NORMAL;\n\
         PRAGMA foreign_keys=ON;\n\
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}

/// Creates `path` (and parents) with permissions `0o700`.
pub(crate) fn create_dir_secure(path: &Path) -> StoreIoResult<()> {
    fs::create_dir_all(path).context(CreateDirSnafu {
        path: path.to_path_buf(),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    }
    Ok(())
}

/// Best-effort `0o600` on a freshly created database file.
pub(crate) fn restrict_file_mode(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

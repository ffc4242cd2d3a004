//! The global store catalog and the in-process registry of open stores.
//!
//! `${dataRoot}/catalog.sqlite` knows every store's name, location, and
//! config. [`StoreRegistry`] keeps at most one [`StoreDb`] handle per store,
//! which is what makes the per-store writer mutex process-wide.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension as _};
use serde::{Deserialize, Serialize};
use skysift_core::filter::FilterExpr;
use skysift_core::id::StoreName;
use skysift_core::time::Timestamp;
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info};

use crate::checkpoint::EvaluationMode;
use crate::{
    create_dir_secure, migrations, restrict_file_mode, CorruptRowSnafu, StoreDb, StoreIoError,
    StoreIoResult, StoredJsonSnafu, LOG_TARGET,
};

#[derive(Debug, Snafu)]
pub enum CatalogError {
    #[snafu(display("store `{name}` not found"))]
    StoreNotFound { name: StoreName },
    #[snafu(display("store `{name}` already exists"))]
    StoreAlreadyExists { name: StoreName },
    #[snafu(transparent)]
    Io { source: StoreIoError },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Per-store options persisted in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Present on derived stores: where the content comes from and how the
    /// filter was allowed to evaluate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<StoreLineage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreLineage {
    pub source_store: StoreName,
    pub filter: FilterExpr,
    pub evaluation_mode: EvaluationMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreMetadata {
    pub name: StoreName,
    /// Store directory, relative to the data root.
    pub root: PathBuf,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub description: Option<String>,
    pub config: StoreConfig,
}

/// Handle to `catalog.sqlite`.
#[derive(Debug)]
pub struct StoreCatalog {
    conn: Mutex<Connection>,
    data_root: PathBuf,
}

impl StoreCatalog {
    pub async fn open(data_root: impl Into<PathBuf>) -> StoreIoResult<StoreCatalog> {
        let data_root = data_root.into();
        debug!(target: LOG_TARGET, root = %data_root.display(), "Opening store catalog");
        create_dir_secure(&data_root)?;

        let path = data_root.join("catalog.sqlite");
        tokio::task::block_in_place(|| {
            let mut conn = Connection::open(&path).context(crate::OpenDbSnafu {
                path: path.clone(),
            })?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\n\
                 PRAGMA synchronous=NORMAL;\n\
                 PRAGMA busy_timeout=5000;",
            )?;
            migrations::run(&mut conn, migrations::CATALOG_MIGRATIONS)?;
            restrict_file_mode(&path);
            Ok(StoreCatalog {
                conn: Mutex::new(conn),
                data_root,
            })
        })
    }

    pub fn data_root(&self) -> &PathBuf {
        &self.data_root
    }

    /// Absolute path of a store's database file.
    pub fn store_db_path(&self, metadata: &StoreMetadata) -> PathBuf {
        self.data_root.join(&metadata.root).join("posts.sqlite")
    }

    /// Registers a store. Idempotent on the name: an existing registration
    /// is returned unchanged.
    pub async fn create(
        &self,
        name: &StoreName,
        description: Option<String>,
        config: StoreConfig,
    ) -> StoreIoResult<StoreMetadata> {
        if let Some(existing) = self.get_opt(name).await? {
            return Ok(existing);
        }

        let now = Timestamp::now();
        let root = PathBuf::from("stores").join(name.as_str());
        let config_json = serde_json::to_string(&config).context(StoredJsonSnafu)?;
        tokio::task::block_in_place(|| -> rusqlite::Result<()> {
            let conn = self.conn.lock().expect("Locking failed");
            conn.execute(
                "INSERT INTO stores (name, root, created_at, updated_at, description, config_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(name) DO NOTHING",
                params![
                    name.as_str(),
                    root.to_string_lossy(),
                    now.to_string(),
                    now.to_string(),
                    description,
                    config_json
                ],
            )?;
            Ok(())
        })?;
        info!(target: LOG_TARGET, store = %name, "Registered store");

        // Read back rather than assume: a concurrent create may have won.
        self.get_opt(name).await?.ok_or_else(|| {
            CorruptRowSnafu {
                what: format!("store `{name}` vanished right after create"),
            }
            .build()
        })
    }

    pub async fn get(&self, name: &StoreName) -> CatalogResult<StoreMetadata> {
        self.get_opt(name)
            .await?
            .ok_or_else(|| CatalogError::StoreNotFound { name: name.clone() })
    }

    pub async fn get_opt(&self, name: &StoreName) -> StoreIoResult<Option<StoreMetadata>> {
        tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            conn.query_row(
                "SELECT name, root, created_at, updated_at, description, config_json
                 FROM stores WHERE name = ?1",
                params![name.as_str()],
                row_to_tuple,
            )
            .optional()?
            .map(decode_store_row)
            .transpose()
        })
    }

    pub async fn get_metadata(&self, name: &StoreName) -> CatalogResult<StoreMetadata> {
        self.get(name).await
    }

    pub async fn get_config(&self, name: &StoreName) -> CatalogResult<StoreConfig> {
        Ok(self.get(name).await?.config)
    }

    /// Every registered store, sorted by name.
    pub async fn list(&self) -> StoreIoResult<Vec<StoreMetadata>> {
        tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            let mut stmt = conn.prepare(
                "SELECT name, root, created_at, updated_at, description, config_json
                 FROM stores ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_tuple)?;
            rows.map(|row| decode_store_row(row?)).collect()
        })
    }

    /// Unregisters the store and removes its on-disk directory.
    pub async fn delete(&self, name: &StoreName) -> CatalogResult<()> {
        let metadata = self.get(name).await?;
        tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            conn.execute("DELETE FROM stores WHERE name = ?1", params![name.as_str()])?;
            Ok::<_, StoreIoError>(())
        })?;

        let dir = self.data_root.join(&metadata.root);
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    target: LOG_TARGET,
                    store = %name,
                    err = %err,
                    "Could not remove store directory"
                );
            }
        }
        info!(target: LOG_TARGET, store = %name, "Deleted store");
        Ok(())
    }

    pub async fn rename(&self, from: &StoreName, to: &StoreName) -> CatalogResult<()> {
        let metadata = self.get(from).await?;
        if self.get_opt(to).await?.is_some() {
            return StoreAlreadyExistsSnafu { name: to.clone() }.fail();
        }

        let new_root = PathBuf::from("stores").join(to.as_str());
        let old_dir = self.data_root.join(&metadata.root);
        let new_dir = self.data_root.join(&new_root);
        if old_dir.exists() {
            std::fs::rename(&old_dir, &new_dir).map_err(|source| {
                StoreIoError::CreateDir {
                    path: new_dir.clone(),
                    source,
                    location: snafu::location!(),
                }
            })?;
        }

        tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            conn.execute(
                "UPDATE stores SET name = ?1, root = ?2, updated_at = ?3 WHERE name = ?4",
                params![
                    to.as_str(),
                    new_root.to_string_lossy(),
                    Timestamp::now().to_string(),
                    from.as_str()
                ],
            )?;
            Ok::<_, StoreIoError>(())
        })?;
        info!(target: LOG_TARGET, %from, %to, "Renamed store");
        Ok(())
    }

    pub async fn update_description(
        &self,
        name: &StoreName,
        description: Option<String>,
    ) -> CatalogResult<()> {
        let changed = tokio::task::block_in_place(|| {
            let conn = self.conn.lock().expect("Locking failed");
            Ok::<_, StoreIoError>(conn.execute(
                "UPDATE stores SET description = ?1, updated_at = ?2 WHERE name = ?3",
                params![
                    description,
                    Timestamp::now().to_string(),
                    name.as_str()
                ],
            )?)
        })?;
        if changed == 0 {
            return StoreNotFoundSnafu { name: name.clone() }.fail();
        }
        Ok(())
    }
}

type StoreRow = (String, String, String, String, Option<String>, String);

fn row_to_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_store_row(row: StoreRow) -> StoreIoResult<StoreMetadata> {
    let (name, root, created_at, updated_at, description, config_json) = row;
    let corrupt = |what: String| CorruptRowSnafu { what }.build();
    Ok(StoreMetadata {
        name: name
            .parse()
            .map_err(|_| corrupt(format!("store name `{name}`")))?,
        root: PathBuf::from(root),
        created_at: created_at
            .parse()
            .map_err(|_| corrupt(format!("created_at of `{name}`")))?,
        updated_at: updated_at
            .parse()
            .map_err(|_| corrupt(format!("updated_at of `{name}`")))?,
        description,
        config: serde_json::from_str(&config_json).context(StoredJsonSnafu)?,
    })
}

/// One open handle per store, process-wide.
///
/// Handing out the same `Arc<StoreDb>` for a name is what turns the
/// connection mutex into the advisory per-store writer lock.
pub struct StoreRegistry {
    catalog: Arc<StoreCatalog>,
    open_stores: tokio::sync::Mutex<HashMap<StoreName, Arc<StoreDb>>>,
}

impl StoreRegistry {
    pub fn new(catalog: Arc<StoreCatalog>) -> Self {
        Self {
            catalog,
            open_stores: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<StoreCatalog> {
        &self.catalog
    }

    /// Opens an existing store. Fails with `StoreNotFound` rather than
    /// auto-creating; creation is an explicit operation.
    pub async fn open(&self, name: &StoreName) -> CatalogResult<Arc<StoreDb>> {
        let mut open_stores = self.open_stores.lock().await;
        if let Some(db) = open_stores.get(name) {
            return Ok(db.clone());
        }
        let metadata = self.catalog.get(name).await?;
        let db = StoreDb::open(self.catalog.store_db_path(&metadata), name.clone())
            .await
            .map_err(CatalogError::from)?;
        let db = Arc::new(db);
        open_stores.insert(name.clone(), db.clone());
        Ok(db)
    }

    /// Registers (idempotently) and opens a store.
    pub async fn create(
        &self,
        name: &StoreName,
        description: Option<String>,
        config: StoreConfig,
    ) -> CatalogResult<Arc<StoreDb>> {
        self.catalog.create(name, description, config).await?;
        self.open(name).await
    }

    /// Drops the open handle and deletes the store.
    pub async fn delete(&self, name: &StoreName) -> CatalogResult<()> {
        self.open_stores.lock().await.remove(name);
        self.catalog.delete(name).await
    }

    /// Renames a store. Any previously handed-out handle for `from` keeps
    /// pointing at the old path and must be reopened by the caller.
    pub async fn rename(&self, from: &StoreName, to: &StoreName) -> CatalogResult<()> {
        let mut open_stores = self.open_stores.lock().await;
        open_stores.remove(from);
        self.catalog.rename(from, to).await
    }
}

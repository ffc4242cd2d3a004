use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, InvalidSettingSnafu, NoDataDirSnafu};

/// Tunables for the sync pipeline. All fields have working defaults; config
/// files override individual keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Accepted posts per commit transaction.
    pub batch_size: usize,
    /// Persist the checkpoint after this many processed items...
    pub checkpoint_every: u64,
    /// ...or after this many milliseconds, whichever comes first.
    pub checkpoint_interval_ms: u64,
    /// Parse/filter tasks in flight (ordered).
    pub concurrency: usize,
    /// Page size requested from paginated feeds.
    pub page_limit: u32,
    pub heartbeat_interval_ms: u64,
    /// Abort once this many per-item errors accumulated.
    pub max_errors: usize,
    /// Jetstream: abort on the first decode error instead of accumulating.
    pub strict: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            checkpoint_every: 100,
            checkpoint_interval_ms: 2_000,
            concurrency: 4,
            page_limit: 50,
            heartbeat_interval_ms: 5_000,
            max_errors: 100,
            strict: false,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return InvalidSettingSnafu {
                name: "batchSize",
                reason: "must be at least 1".to_owned(),
            }
            .fail();
        }
        if self.concurrency == 0 {
            return InvalidSettingSnafu {
                name: "concurrency",
                reason: "must be at least 1".to_owned(),
            }
            .fail();
        }
        if self.page_limit == 0 {
            return InvalidSettingSnafu {
                name: "pageLimit",
                reason: "must be at least 1".to_owned(),
            }
            .fail();
        }
        Ok(())
    }
}

/// Platform data root (`~/.local/share/skysift` on Linux).
pub fn default_data_root() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("", "", "skysift")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| NoDataDirSnafu.build())
}

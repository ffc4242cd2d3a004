use serde::Serialize;
use skysift_filter::{FilterCompileError, FilterEvalError};
use skysift_store::{CatalogError, StoreIoError};
use snafu::Snafu;

/// Failure reported by the feed capability (network client lives elsewhere;
/// this is the shape it surfaces).
#[derive(Debug, Clone, Snafu)]
pub enum BskyError {
    #[snafu(display("feed request failed: {message}"))]
    Feed { message: String },
    #[snafu(display("firehose message could not be decoded: {message}"))]
    FirehoseDecode { message: String },
    #[snafu(display("firehose connection failed: {message}"))]
    Firehose { message: String },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("invalid setting `{name}`: {reason}"))]
    InvalidSetting { name: &'static str, reason: String },
    #[snafu(display("no data directory could be determined for this platform"))]
    NoDataDir,
}

/// Where in the pipeline an item failed.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStage {
    Source,
    Parse,
    Filter,
    Store,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStage::Source => "source",
            SyncStage::Parse => "parse",
            SyncStage::Filter => "filter",
            SyncStage::Store => "store",
        };
        f.write_str(s)
    }
}

/// A per-item failure. Recorded in [`crate::SyncResult::errors`] without
/// aborting the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemError {
    pub stage: SyncStage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Fatal sync/derivation failure. Per-item parse and filter errors are not
/// fatal; these are.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(transparent)]
    Store { source: StoreIoError },
    #[snafu(transparent)]
    Catalog { source: CatalogError },
    #[snafu(transparent)]
    Compile { source: FilterCompileError },
    #[snafu(display("source stream failed: {source}"))]
    Source { source: BskyError },
    #[snafu(display("filter evaluation failed fatally: {source}"))]
    Eval { source: FilterEvalError },
    #[snafu(display("aborted after {count} item errors"))]
    TooManyErrors { count: usize },
    #[snafu(display("eventTime derivation cannot use oracle-backed filters"))]
    EventTimeEffectful,
}

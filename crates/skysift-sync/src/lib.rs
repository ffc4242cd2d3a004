//! Sync and derivation engines.
//!
//! The sync engine pulls raw items from a [`feed::FeedSource`], parses and
//! filters them with bounded concurrency, commits accepted batches into a
//! store, and keeps a per-`(store, source)` checkpoint so an interrupted run
//! resumes where it left off. The derivation engine replays one store's event
//! log through a filter into another store, propagating deletes.

pub mod derive;
pub mod engine;
mod error;
pub mod feed;
mod jetstream;
pub mod parse;
mod settings;

pub use derive::{DerivationEngine, DerivationResult, DeriveOptions};
pub use engine::{
    CommitPolicy, ProgressReporter, SyncEngine, SyncOptions, SyncProgress, SyncResult,
    TracingReporter,
};
pub use error::{BskyError, ConfigError, SyncError, SyncItemError, SyncStage};
pub use feed::{CommitMessage, CommitOperation, FeedOptions, FeedSource, JetstreamOptions, RawPost};
pub use parse::{parse_raw_post, ParseError};
pub use settings::{default_data_root, SyncSettings};

const LOG_TARGET: &str = "skysift::sync";

#[cfg(test)]
mod tests;

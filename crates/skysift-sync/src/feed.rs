//! The feed capability: where raw posts come from.
//!
//! The actual XRPC/websocket client is out of scope; the engine consumes this
//! trait and tests provide in-memory implementations.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use skysift_core::id::{Cid, Did, PostUri};
use skysift_core::source::AuthorFeedFilter;

use crate::error::BskyError;

/// A raw feed item: the wire JSON plus the cursor of the page it arrived on.
///
/// The page cursor is opaque to the engine; it is only ever round-tripped
/// into checkpoints and back into [`FeedOptions::cursor`].
#[derive(Debug, Clone)]
pub struct RawPost {
    pub value: serde_json::Value,
    pub page_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub filter: Option<AuthorFeedFilter>,
    pub include_pins: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JetstreamOptions {
    pub endpoint: Option<String>,
    pub collections: Option<Vec<String>>,
    pub dids: Option<Vec<Did>>,
    pub compress: Option<bool>,
    pub max_message_size_bytes: Option<u32>,
    /// Resume position: the `time_us` of the last handled message.
    pub cursor: Option<String>,
}

pub type RawPostStream = Pin<Box<dyn Stream<Item = Result<RawPost, BskyError>> + Send>>;
pub type CommitStream = Pin<Box<dyn Stream<Item = Result<CommitMessage, BskyError>> + Send>>;

/// One firehose message carrying a repo commit operation.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitMessage {
    pub did: Did,
    pub time_us: u64,
    pub commit: CommitOp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitOp {
    pub operation: CommitOperation,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub cid: Option<Cid>,
    /// Present on create/update; the bare record, not a view.
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

impl CommitMessage {
    /// Record URI of the commit's subject.
    pub fn uri(&self) -> Result<PostUri, skysift_core::id::IdParseError> {
        PostUri::from_parts(&self.did, &self.commit.collection, &self.commit.rkey)
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn get_timeline(&self, opts: FeedOptions) -> Result<RawPostStream, BskyError>;

    async fn get_feed(&self, uri: &str, opts: FeedOptions) -> Result<RawPostStream, BskyError>;

    async fn get_list_feed(&self, uri: &str, opts: FeedOptions)
        -> Result<RawPostStream, BskyError>;

    async fn get_notifications(&self, opts: FeedOptions) -> Result<RawPostStream, BskyError>;

    async fn get_author_feed(
        &self,
        actor: &str,
        opts: FeedOptions,
    ) -> Result<RawPostStream, BskyError>;

    /// Finite: a thread is fetched whole, not paginated.
    async fn get_post_thread(
        &self,
        uri: &PostUri,
        depth: Option<u32>,
        parent_height: Option<u32>,
    ) -> Result<Vec<RawPost>, BskyError>;

    async fn jetstream(&self, opts: JetstreamOptions) -> Result<CommitStream, BskyError>;
}

//! Event log entry types.
//!
//! Every mutation of a store is recorded as a [`PostEvent`] appended to the
//! store's log. The log is the source of truth; the post index is a cache
//! that can be rebuilt from it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::id::PostUri;
use crate::post::Post;
use crate::time::Timestamp;

/// Bumped when the persisted event JSON changes shape.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Position of an event within one store's log.
///
/// Strictly increasing and dense per store; assigned by the database on
/// append, never by callers.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventSeq(pub u64);

impl fmt::Display for EventSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for EventSeq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Globally unique, lexicographically sortable event id (UUID v7).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(uuid::Uuid);

#[derive(Debug, Snafu)]
#[snafu(display("invalid event id `{input}`"))]
pub struct EventIdParseError {
    input: String,
    source: uuid::Error,
}

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = EventIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|source| EventIdParseError {
                input: s.to_owned(),
                source,
            })
    }
}

/// Where a batch of events came from.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Timeline,
    Feed,
    List,
    Notifications,
    Author,
    Thread,
    Jetstream,
    /// Events produced by replaying another store's log.
    Derivation,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Timeline => "timeline",
            SourceKind::Feed => "feed",
            SourceKind::List => "list",
            SourceKind::Notifications => "notifications",
            SourceKind::Author => "author",
            SourceKind::Thread => "thread",
            SourceKind::Jetstream => "jetstream",
            SourceKind::Derivation => "derivation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub source: SourceKind,
    /// The invocation that produced the event, e.g. `sync timeline tech`.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_expr_hash: Option<crate::filter::FilterHash>,
    pub created_at: Timestamp,
}

/// A single mutation recorded in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum PostEvent {
    PostUpsert { post: Post, meta: EventMeta },
    PostDelete { uri: PostUri, meta: EventMeta },
}

impl PostEvent {
    pub fn uri(&self) -> &PostUri {
        match self {
            PostEvent::PostUpsert { post, .. } => &post.uri,
            PostEvent::PostDelete { uri, .. } => uri,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            PostEvent::PostUpsert { meta, .. } => meta,
            PostEvent::PostDelete { meta, .. } => meta,
        }
    }

    /// The `kind` column value in `event_log`.
    pub fn kind(&self) -> EventKind {
        match self {
            PostEvent::PostUpsert { .. } => EventKind::Upsert,
            PostEvent::PostDelete { .. } => EventKind::Delete,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum EventKind {
    Upsert,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Upsert => "upsert",
            EventKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown event kind `{input}`"))]
pub struct EventKindParseError {
    input: String,
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(EventKind::Upsert),
            "delete" => Ok(EventKind::Delete),
            _ => Err(EventKindParseError {
                input: s.to_owned(),
            }),
        }
    }
}

/// A committed event, as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogEntry {
    pub seq: EventSeq,
    pub id: EventId,
    pub version: u32,
    pub event: PostEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_string_round_trip() {
        let a = EventId::generate();
        let back: EventId = a.to_string().parse().unwrap();
        assert_eq!(a, back);
        assert_ne!(a, EventId::generate());
    }

    #[test]
    fn event_wire_format_tags() {
        let meta = EventMeta {
            source: SourceKind::Timeline,
            command: "sync timeline tech".to_owned(),
            filter_expr_hash: None,
            created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
        };
        let event = PostEvent::PostDelete {
            uri: "at://did:plc:alice/app.bsky.feed.post/3kdel"
                .parse()
                .unwrap(),
            meta,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["_tag"], "PostDelete");
        assert_eq!(json["meta"]["source"], "timeline");
        assert_eq!(event.kind().as_str(), "delete");

        let back: PostEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, back);
    }
}

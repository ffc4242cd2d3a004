//! Where raw posts come from.

use serde::{Deserialize, Serialize};

use crate::event::SourceKind;
use crate::id::{Did, PostUri};

/// Author-feed server-side filter.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorFeedFilter {
    PostsWithReplies,
    PostsNoReplies,
    PostsWithMedia,
    PostsAndAuthorThreads,
}

impl AuthorFeedFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorFeedFilter::PostsWithReplies => "posts_with_replies",
            AuthorFeedFilter::PostsNoReplies => "posts_no_replies",
            AuthorFeedFilter::PostsWithMedia => "posts_with_media",
            AuthorFeedFilter::PostsAndAuthorThreads => "posts_and_author_threads",
        }
    }
}

/// A source of raw posts for the sync engine.
///
/// Closed sum; the checkpoint `source_key` is derived from the variant and
/// its parameters, so two syncs of the same source share a checkpoint while
/// any parameter change starts a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum DataSource {
    Timeline,
    Feed {
        uri: String,
    },
    List {
        uri: String,
    },
    Notifications,
    Author {
        actor: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<AuthorFeedFilter>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_pins: Option<bool>,
    },
    Thread {
        uri: PostUri,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        depth: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_height: Option<u32>,
    },
    Jetstream {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collections: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dids: Option<Vec<Did>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compress: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_message_size_bytes: Option<u32>,
    },
}

impl DataSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            DataSource::Timeline => SourceKind::Timeline,
            DataSource::Feed { .. } => SourceKind::Feed,
            DataSource::List { .. } => SourceKind::List,
            DataSource::Notifications => SourceKind::Notifications,
            DataSource::Author { .. } => SourceKind::Author,
            DataSource::Thread { .. } => SourceKind::Thread,
            DataSource::Jetstream { .. } => SourceKind::Jetstream,
        }
    }

    /// Deterministic checkpoint key.
    ///
    /// Arrays are sorted and unset optionals omitted, so two values that
    /// describe the same source always produce the same key.
    pub fn source_key(&self) -> String {
        match self {
            DataSource::Timeline => "timeline".to_owned(),
            DataSource::Feed { uri } => format!("feed:{uri}"),
            DataSource::List { uri } => format!("list:{uri}"),
            DataSource::Notifications => "notifications".to_owned(),
            DataSource::Author {
                actor,
                filter,
                include_pins,
            } => {
                let mut key = format!("author:{actor}");
                if let Some(filter) = filter {
                    key.push_str(":filter=");
                    key.push_str(filter.as_str());
                }
                if let Some(pins) = include_pins {
                    key.push_str(if *pins { ":pins=1" } else { ":pins=0" });
                }
                key
            }
            DataSource::Thread {
                uri,
                depth,
                parent_height,
            } => {
                let mut key = format!("thread:{uri}");
                if let Some(depth) = depth {
                    key.push_str(&format!(":depth={depth}"));
                }
                if let Some(height) = parent_height {
                    key.push_str(&format!(":height={height}"));
                }
                key
            }
            DataSource::Jetstream {
                endpoint,
                collections,
                dids,
                compress,
                max_message_size_bytes,
            } => {
                let mut key = "jetstream".to_owned();
                if let Some(endpoint) = endpoint {
                    key.push_str(&format!(":endpoint={endpoint}"));
                }
                if let Some(collections) = collections {
                    let mut sorted = collections.clone();
                    sorted.sort_unstable();
                    sorted.dedup();
                    key.push_str(&format!(":collections={}", sorted.join(",")));
                }
                if let Some(dids) = dids {
                    let mut sorted: Vec<&str> = dids.iter().map(Did::as_str).collect();
                    sorted.sort_unstable();
                    sorted.dedup();
                    key.push_str(&format!(":dids={}", sorted.join(",")));
                }
                if let Some(compress) = compress {
                    key.push_str(if *compress {
                        ":compress=1"
                    } else {
                        ":compress=0"
                    });
                }
                if let Some(max) = max_message_size_bytes {
                    key.push_str(&format!(":maxmsg={max}"));
                }
                key
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_key_is_order_insensitive() {
        let a = DataSource::Jetstream {
            endpoint: None,
            collections: Some(vec!["b.coll".to_owned(), "a.coll".to_owned()]),
            dids: Some(vec![
                "did:plc:zed".parse().unwrap(),
                "did:plc:abc".parse().unwrap(),
            ]),
            compress: None,
            max_message_size_bytes: None,
        };
        let b = DataSource::Jetstream {
            endpoint: None,
            collections: Some(vec!["a.coll".to_owned(), "b.coll".to_owned()]),
            dids: Some(vec![
                "did:plc:abc".parse().unwrap(),
                "did:plc:zed".parse().unwrap(),
            ]),
            compress: None,
            max_message_size_bytes: None,
        };
        assert_eq!(a.source_key(), b.source_key());
        assert_eq!(
            a.source_key(),
            "jetstream:collections=a.coll,b.coll:dids=did:plc:abc,did:plc:zed"
        );
    }

    #[test]
    fn source_key_distinguishes_parameters() {
        let plain = DataSource::Author {
            actor: "alice.test".to_owned(),
            filter: None,
            include_pins: None,
        };
        let pinned = DataSource::Author {
            actor: "alice.test".to_owned(),
            filter: Some(AuthorFeedFilter::PostsNoReplies),
            include_pins: Some(true),
        };
        assert_eq!(plain.source_key(), "author:alice.test");
        assert_eq!(
            pinned.source_key(),
            "author:alice.test:filter=posts_no_replies:pins=1"
        );
    }

    #[test]
    fn json_round_trip() {
        let source = DataSource::Thread {
            uri: "at://did:plc:alice/app.bsky.feed.post/3kroot"
                .parse()
                .unwrap(),
            depth: Some(6),
            parent_height: None,
        };
        let json = serde_json::to_string(&source).unwrap();
        let back: DataSource = serde_json::from_str(&json).unwrap();
        assert_eq!(source, back);
        assert_eq!(source.kind(), SourceKind::Thread);
    }
}

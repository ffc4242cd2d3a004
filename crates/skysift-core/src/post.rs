//! The normalized post entity.
//!
//! A [`Post`] is what the sync pipeline stores after parsing a raw feed item:
//! stripped of view-level noise, keyed by its record URI, with hashtags,
//! mentions and links already extracted from facets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::id::{Cid, Did, Handle, Hashtag, PostUri};
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub uri: PostUri,
    pub cid: Cid,
    pub author: Handle,
    pub author_did: Did,
    pub text: String,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hashtags: BTreeSet<Hashtag>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub mentions: BTreeSet<Did>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub links: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<Embed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FeedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PostMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langs: Option<Vec<String>>,
}

/// Embedded media/record attached to a post.
///
/// Closed sum: adding a variant must break every `match` that inspects
/// embeds, which is exactly what the filter evaluator relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Embed {
    Images { images: Vec<ImageEmbed> },
    Video { video: VideoEmbed },
    External { external: ExternalEmbed },
    Record { record: RecordEmbed },
    RecordWithMedia { record: RecordEmbed, media: MediaEmbed },
}

/// The media half of a `RecordWithMedia` embed. A record cannot carry another
/// record here, hence the narrower sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum MediaEmbed {
    Images { images: Vec<ImageEmbed> },
    Video { video: VideoEmbed },
    External { external: ExternalEmbed },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEmbed {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEmbed {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEmbed {
    pub uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEmbed {
    pub uri: PostUri,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    pub uri: PostUri,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: PostRef,
    pub parent: PostRef,
}

/// Why a post appeared in a feed (set by feed views, absent on raw records).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum FeedReason {
    ReasonRepost {
        by: Did,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        indexed_at: Option<Timestamp>,
    },
    ReasonPin {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMetrics {
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub repost_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub quote_count: u64,
}

impl Post {
    /// All image embeds, whether direct or inside `RecordWithMedia`.
    pub fn image_embeds(&self) -> &[ImageEmbed] {
        match &self.embed {
            Some(Embed::Images { images }) => images,
            Some(Embed::RecordWithMedia {
                media: MediaEmbed::Images { images },
                ..
            }) => images,
            _ => &[],
        }
    }

    pub fn has_images(&self) -> bool {
        !self.image_embeds().is_empty()
    }

    pub fn has_video(&self) -> bool {
        matches!(
            &self.embed,
            Some(Embed::Video { .. })
                | Some(Embed::RecordWithMedia {
                    media: MediaEmbed::Video { .. },
                    ..
                })
        )
    }

    pub fn external_embed(&self) -> Option<&ExternalEmbed> {
        match &self.embed {
            Some(Embed::External { external }) => Some(external),
            Some(Embed::RecordWithMedia {
                media: MediaEmbed::External { external },
                ..
            }) => Some(external),
            _ => None,
        }
    }

    /// Any outbound link: a facet link in the text or an external-link embed.
    pub fn has_links(&self) -> bool {
        !self.links.is_empty() || self.external_embed().is_some()
    }

    /// All URLs a link-validity oracle would need to check.
    pub fn all_links(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = self.links.iter().map(String::as_str).collect();
        if let Some(external) = self.external_embed() {
            urls.push(external.uri.as_str());
        }
        urls
    }

    pub fn has_media(&self) -> bool {
        self.has_images() || self.has_video() || self.has_links()
    }

    pub fn has_embed(&self) -> bool {
        self.embed.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn is_quote(&self) -> bool {
        matches!(
            &self.embed,
            Some(Embed::Record { .. }) | Some(Embed::RecordWithMedia { .. })
        )
    }

    pub fn is_repost(&self) -> bool {
        matches!(&self.reason, Some(FeedReason::ReasonRepost { .. }))
    }

    pub fn is_original(&self) -> bool {
        !self.is_reply() && !self.is_quote() && !self.is_repost()
    }

    /// The record this post quotes, if any.
    pub fn quoted_record(&self) -> Option<&RecordEmbed> {
        match &self.embed {
            Some(Embed::Record { record }) => Some(record),
            Some(Embed::RecordWithMedia { record, .. }) => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_post(rkey: &str) -> Post {
        Post {
            uri: format!("at://did:plc:alice/app.bsky.feed.post/{rkey}")
                .parse()
                .unwrap(),
            cid: "bafyreib2rxk3rh6kzwq".parse().unwrap(),
            author: "alice.bsky.social".parse().unwrap(),
            author_did: "did:plc:alice".parse().unwrap(),
            text: "hello world".to_owned(),
            created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
            hashtags: BTreeSet::new(),
            mentions: BTreeSet::new(),
            links: BTreeSet::new(),
            embed: None,
            reply: None,
            reason: None,
            metrics: None,
            langs: None,
        }
    }

    #[test]
    fn media_helpers_see_through_record_with_media() {
        let mut post = sample_post("3kmedia");
        post.embed = Some(Embed::RecordWithMedia {
            record: RecordEmbed {
                uri: "at://did:plc:bob/app.bsky.feed.post/3kother"
                    .parse()
                    .unwrap(),
                cid: "bafyreib2rxk3rh6kzwa".parse().unwrap(),
            },
            media: MediaEmbed::Images {
                images: vec![ImageEmbed {
                    url: "https://cdn.example/img.jpg".to_owned(),
                    alt: Some("a bird".to_owned()),
                }],
            },
        });

        assert!(post.has_images());
        assert!(!post.has_video());
        assert!(post.is_quote());
        assert!(post.has_embed());
        assert!(post.has_media());
        assert!(!post.is_original());
    }

    #[test]
    fn original_means_no_reply_quote_repost() {
        let post = sample_post("3korig");
        assert!(post.is_original());

        let mut repost = sample_post("3krepost");
        repost.reason = Some(FeedReason::ReasonRepost {
            by: "did:plc:carol".parse().unwrap(),
            indexed_at: None,
        });
        assert!(repost.is_repost());
        assert!(!repost.is_original());
    }

    #[test]
    fn all_links_includes_external_embed() {
        let mut post = sample_post("3klinks");
        post.links.insert("https://example.com/a".to_owned());
        post.embed = Some(Embed::External {
            external: ExternalEmbed {
                uri: "https://example.com/card".to_owned(),
                title: String::new(),
                description: String::new(),
            },
        });
        let links = post.all_links();
        assert_eq!(links.len(), 2);
        assert!(post.has_links());
    }

    #[test]
    fn post_json_round_trip() {
        let mut post = sample_post("3kjson");
        post.metrics = Some(PostMetrics {
            like_count: 7,
            ..Default::default()
        });
        let json = serde_json::to_string(&post).unwrap();
        let back: Post = serde_json::from_str(&json).unwrap();
        assert_eq!(post, back);
    }
}

//! Raw feed items → normalized [`Post`]s.
//!
//! Feed views and bare firehose records share most of their shape; both paths
//! funnel through the same facet/embed extraction. Unknown `$type`s are
//! tolerated and dropped rather than failing the item.

use std::collections::BTreeSet;

use serde::Deserialize;
use skysift_core::id::{Did, Handle, Hashtag, PostUri};
use skysift_core::post::{
    Embed, ExternalEmbed, FeedReason, ImageEmbed, MediaEmbed, Post, PostMetrics, PostRef,
    RecordEmbed, ReplyRef, VideoEmbed,
};
use skysift_core::time::Timestamp;
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use crate::feed::RawPost;

#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("item is not a feed post: {source}"))]
    Shape { source: serde_json::Error },
    #[snafu(display("invalid {what} `{value}`"))]
    BadField { what: &'static str, value: String },
    #[snafu(display("invalid createdAt `{value}`"))]
    BadTimestamp { value: String },
    #[snafu(display("record has no createdAt"))]
    MissingCreatedAt,
}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Deserialize)]
struct WireFeedItem {
    post: WirePostView,
    #[serde(default)]
    reason: Option<WireReason>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePostView {
    uri: String,
    cid: String,
    author: WireActor,
    record: WireRecord,
    #[serde(default)]
    embed: Option<WireEmbed>,
    #[serde(default)]
    like_count: Option<u64>,
    #[serde(default)]
    repost_count: Option<u64>,
    #[serde(default)]
    reply_count: Option<u64>,
    #[serde(default)]
    quote_count: Option<u64>,
}

#[derive(Deserialize)]
struct WireActor {
    did: String,
    handle: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    langs: Option<Vec<String>>,
    #[serde(default)]
    facets: Vec<WireFacet>,
    #[serde(default)]
    reply: Option<WireReplyRef>,
    #[serde(default)]
    embed: Option<WireEmbed>,
}

#[derive(Deserialize)]
struct WireFacet {
    #[serde(default)]
    features: Vec<WireFacetFeature>,
}

#[derive(Deserialize)]
#[serde(tag = "$type")]
enum WireFacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#tag")]
    Tag { tag: String },
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention { did: String },
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireReplyRef {
    root: WireStrongRef,
    parent: WireStrongRef,
}

#[derive(Deserialize)]
struct WireStrongRef {
    uri: String,
    cid: String,
}

#[derive(Deserialize)]
#[serde(tag = "$type")]
enum WireEmbed {
    #[serde(rename = "app.bsky.embed.images#view", alias = "app.bsky.embed.images")]
    Images { images: Vec<WireImage> },
    #[serde(rename = "app.bsky.embed.video#view", alias = "app.bsky.embed.video")]
    Video {
        #[serde(default)]
        playlist: Option<String>,
        #[serde(default)]
        alt: Option<String>,
    },
    #[serde(
        rename = "app.bsky.embed.external#view",
        alias = "app.bsky.embed.external"
    )]
    External { external: WireExternal },
    #[serde(rename = "app.bsky.embed.record#view", alias = "app.bsky.embed.record")]
    Record { record: WireRecordView },
    #[serde(
        rename = "app.bsky.embed.recordWithMedia#view",
        alias = "app.bsky.embed.recordWithMedia"
    )]
    RecordWithMedia {
        record: WireRecordView,
        media: Box<WireEmbed>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireImage {
    #[serde(default)]
    fullsize: Option<String>,
    #[serde(default)]
    thumb: Option<String>,
    #[serde(default)]
    image: Option<serde_json::Value>,
    #[serde(default)]
    alt: Option<String>,
}

#[derive(Deserialize)]
struct WireExternal {
    uri: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// Quoted-record reference. Views nest the strong ref one level deeper than
/// bare records do; accept both.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireRecordView {
    Nested { record: WireStrongRef },
    Flat(WireStrongRef),
}

#[derive(Deserialize)]
#[serde(tag = "$type")]
enum WireReason {
    #[serde(rename = "app.bsky.feed.defs#reasonRepost")]
    Repost {
        by: WireActor,
        #[serde(default, rename = "indexedAt")]
        indexed_at: Option<String>,
    },
    #[serde(rename = "app.bsky.feed.defs#reasonPin")]
    Pin {},
    #[serde(other)]
    Other,
}

/// Parses a feed-view item into a normalized post.
pub fn parse_raw_post(raw: &RawPost) -> ParseResult<Post> {
    let item: WireFeedItem = serde_json::from_value(raw.value.clone()).context(ShapeSnafu)?;
    let view = item.post;

    let uri: PostUri = parse_field("post uri", &view.uri)?;
    let cid = parse_field("post cid", &view.cid)?;
    let author_did: Did = parse_field("author did", &view.author.did)?;
    let author: Handle = parse_field("author handle", &view.author.handle)?;

    let mut post = post_from_record(uri, cid, author, author_did, view.record)?;
    // The hydrated view embed wins over whatever the bare record carried.
    if let Some(embed) = view.embed {
        post.embed = map_embed(embed);
    }
    post.reason = item.reason.and_then(map_reason);

    let has_metrics = view.like_count.is_some()
        || view.repost_count.is_some()
        || view.reply_count.is_some()
        || view.quote_count.is_some();
    if has_metrics {
        post.metrics = Some(PostMetrics {
            like_count: view.like_count.unwrap_or(0),
            repost_count: view.repost_count.unwrap_or(0),
            reply_count: view.reply_count.unwrap_or(0),
            quote_count: view.quote_count.unwrap_or(0),
        });
    }
    Ok(post)
}

/// Parses a bare record (firehose path) into a post. The firehose carries no
/// handle; callers resolve one or pass the `handle.invalid` placeholder.
pub fn parse_bare_record(
    uri: PostUri,
    cid: skysift_core::id::Cid,
    author: Handle,
    author_did: Did,
    record: &serde_json::Value,
) -> ParseResult<Post> {
    let record: WireRecord = serde_json::from_value(record.clone()).context(ShapeSnafu)?;
    post_from_record(uri, cid, author, author_did, record)
}

fn post_from_record(
    uri: PostUri,
    cid: skysift_core::id::Cid,
    author: Handle,
    author_did: Did,
    record: WireRecord,
) -> ParseResult<Post> {
    let created_at_raw = record.created_at.as_deref().context(MissingCreatedAtSnafu)?;
    let created_at: Timestamp =
        created_at_raw
            .parse()
            .map_err(|_| ParseError::BadTimestamp {
                value: created_at_raw.to_owned(),
            })?;

    let mut hashtags: BTreeSet<Hashtag> = BTreeSet::new();
    let mut mentions: BTreeSet<Did> = BTreeSet::new();
    let mut links: BTreeSet<String> = BTreeSet::new();
    for facet in &record.facets {
        for feature in &facet.features {
            match feature {
                WireFacetFeature::Tag { tag } => {
                    // A malformed tag spoils the facet, not the post.
                    if let Ok(tag) = tag.parse() {
                        hashtags.insert(tag);
                    }
                }
                WireFacetFeature::Mention { did } => {
                    if let Ok(did) = did.parse() {
                        mentions.insert(did);
                    }
                }
                WireFacetFeature::Link { uri } => {
                    links.insert(uri.clone());
                }
                WireFacetFeature::Other => {}
            }
        }
    }

    let reply = record
        .reply
        .as_ref()
        .map(|r| {
            Ok::<_, ParseError>(ReplyRef {
                root: strong_ref(&r.root)?,
                parent: strong_ref(&r.parent)?,
            })
        })
        .transpose()?;

    Ok(Post {
        uri,
        cid,
        author,
        author_did,
        text: record.text,
        created_at,
        hashtags,
        mentions,
        links,
        embed: record.embed.and_then(map_embed),
        reply,
        reason: None,
        metrics: None,
        langs: record.langs,
    })
}

fn strong_ref(wire: &WireStrongRef) -> ParseResult<PostRef> {
    Ok(PostRef {
        uri: parse_field("reply uri", &wire.uri)?,
        cid: parse_field("reply cid", &wire.cid)?,
    })
}

fn parse_field<T: std::str::FromStr>(what: &'static str, value: &str) -> ParseResult<T> {
    value.parse().map_err(|_| ParseError::BadField {
        what,
        value: value.to_owned(),
    })
}

fn map_embed(wire: WireEmbed) -> Option<Embed> {
    match wire {
        WireEmbed::Images { images } => Some(Embed::Images {
            images: images.into_iter().map(map_image).collect(),
        }),
        WireEmbed::Video { playlist, alt } => Some(Embed::Video {
            video: VideoEmbed {
                url: playlist.unwrap_or_default(),
                alt,
            },
        }),
        WireEmbed::External { external } => Some(Embed::External {
            external: ExternalEmbed {
                uri: external.uri,
                title: external.title,
                description: external.description,
            },
        }),
        WireEmbed::Record { record } => map_record_ref(record).map(|record| Embed::Record { record }),
        WireEmbed::RecordWithMedia { record, media } => {
            let record = map_record_ref(record)?;
            match map_embed(*media) {
                Some(Embed::Images { images }) => Some(Embed::RecordWithMedia {
                    record,
                    media: MediaEmbed::Images { images },
                }),
                Some(Embed::Video { video }) => Some(Embed::RecordWithMedia {
                    record,
                    media: MediaEmbed::Video { video },
                }),
                Some(Embed::External { external }) => Some(Embed::RecordWithMedia {
                    record,
                    media: MediaEmbed::External { external },
                }),
                // A record inside the media slot is malformed; keep the quote.
                _ => Some(Embed::Record { record }),
            }
        }
        WireEmbed::Other => None,
    }
}

fn map_image(wire: WireImage) -> ImageEmbed {
    let url = wire
        .fullsize
        .or(wire.thumb)
        .or_else(|| {
            wire.image
                .as_ref()
                .and_then(|blob| blob.get("ref"))
                .and_then(|r| r.get("$link"))
                .and_then(|l| l.as_str())
                .map(|cid| format!("blob://{cid}"))
        })
        .unwrap_or_default();
    ImageEmbed {
        url,
        alt: wire.alt.filter(|alt| !alt.is_empty()),
    }
}

fn map_record_ref(wire: WireRecordView) -> Option<RecordEmbed> {
    let strong = match wire {
        WireRecordView::Nested { record } => record,
        WireRecordView::Flat(record) => record,
    };
    let uri = strong.uri.parse().ok()?;
    let cid = strong.cid.parse().ok()?;
    Some(RecordEmbed { uri, cid })
}

fn map_reason(wire: WireReason) -> Option<FeedReason> {
    match wire {
        WireReason::Repost { by, indexed_at } => {
            let by: Did = by.did.parse().ok()?;
            let indexed_at = indexed_at.and_then(|s| s.parse().ok());
            Some(FeedReason::ReasonRepost { by, indexed_at })
        }
        WireReason::Pin {} => Some(FeedReason::ReasonPin {}),
        WireReason::Other => None,
    }
}

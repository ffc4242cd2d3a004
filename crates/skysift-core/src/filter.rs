//! Filter expression tree and its canonical JSON codec.
//!
//! Expressions are value objects: immutable, comparable, and hashable via a
//! canonical signature. Compilation and evaluation live in `skysift-filter`;
//! this module only defines the shape and the wire encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::id::{Handle, Hashtag};
use crate::time::Timestamp;

/// What an effectful leaf does when its oracle fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum OnErrorPolicy {
    /// Treat the failure as a match.
    Include,
    /// Treat the failure as a non-match.
    Exclude,
    /// Retry with fixed spacing, then fail the evaluation.
    Retry {
        max_retries: u32,
        /// Fixed delay between attempts, milliseconds.
        base_delay: u64,
    },
}

/// A post predicate as a closed algebraic tree.
///
/// The JSON encoding is `_tag`-tagged with camelCase fields; `decode ∘ encode`
/// is the identity on every variant, which the signature hashing depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum FilterExpr {
    /// Matches every post.
    All,
    /// Matches nothing.
    None,
    And {
        exprs: Vec<FilterExpr>,
    },
    Or {
        exprs: Vec<FilterExpr>,
    },
    Not {
        expr: Box<FilterExpr>,
    },
    Author {
        handle: Handle,
    },
    AuthorIn {
        handles: Vec<Handle>,
    },
    Hashtag {
        tag: Hashtag,
    },
    HashtagIn {
        tags: Vec<Hashtag>,
    },
    /// Substring match on `post.text`. Case-insensitive on Unicode scalar
    /// values unless `caseSensitive` is set.
    Contains {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        case_sensitive: Option<bool>,
    },
    IsReply,
    IsQuote,
    IsRepost,
    IsOriginal,
    /// Every specified minimum must be met.
    Engagement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_likes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_reposts: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_replies: Option<u64>,
    },
    HasImages,
    MinImages {
        min: u32,
    },
    /// At least one image with non-empty alt text.
    HasAltText,
    /// At least one image, none of which carry alt text.
    NoAltText,
    /// Case-insensitive substring over all image alt texts.
    AltText {
        text: String,
    },
    AltTextRegex {
        pattern: String,
    },
    HasVideo,
    HasLinks,
    HasMedia,
    HasEmbed,
    Language {
        lang: String,
    },
    /// OR over the patterns, matched against `post.text`.
    Regex {
        patterns: Vec<String>,
    },
    /// Inclusive on both ends; `start == end` matches that exact instant.
    DateRange {
        start: Timestamp,
        end: Timestamp,
    },
    HasValidLinks {
        on_error: OnErrorPolicy,
    },
    Trending {
        tag: Hashtag,
        on_error: OnErrorPolicy,
    },
}

impl FilterExpr {
    pub fn and(exprs: Vec<FilterExpr>) -> Self {
        FilterExpr::And { exprs }
    }

    pub fn or(exprs: Vec<FilterExpr>) -> Self {
        FilterExpr::Or { exprs }
    }

    pub fn not(expr: FilterExpr) -> Self {
        FilterExpr::Not {
            expr: Box::new(expr),
        }
    }

    /// True if evaluating the expression may call an oracle.
    pub fn is_effectful(&self) -> bool {
        match self {
            FilterExpr::HasValidLinks { .. } | FilterExpr::Trending { .. } => true,
            FilterExpr::And { exprs } | FilterExpr::Or { exprs } => {
                exprs.iter().any(FilterExpr::is_effectful)
            }
            FilterExpr::Not { expr } => expr.is_effectful(),
            _ => false,
        }
    }

    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("FilterExpr serialization cannot fail")
    }

    pub fn decode(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Canonical JSON: object keys lexicographically sorted, no insignificant
    /// whitespace. `serde_json::Value` maps are BTree-backed here (the
    /// `preserve_order` feature must stay off), so a plain dump is canonical.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.encode()).expect("serializing a Value cannot fail")
    }

    /// Stable identity of the expression, used to detect filter changes
    /// across sync runs and derivations.
    pub fn signature(&self) -> FilterHash {
        FilterHash(*blake3::hash(self.canonical_json().as_bytes()).as_bytes())
    }
}

/// blake3 of the canonical JSON encoding, displayed as lowercase hex.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FilterHash([u8; 32]);

impl fmt::Display for FilterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        data_encoding::HEXLOWER.encode_write(&self.0, f)
    }
}

impl fmt::Debug for FilterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterHash({self})")
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("invalid filter hash `{input}`"))]
pub struct FilterHashParseError {
    input: String,
}

impl FromStr for FilterHash {
    type Err = FilterHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| FilterHashParseError {
                input: s.to_owned(),
            })?;
        let arr = bytes.try_into().map_err(|_| FilterHashParseError {
            input: s.to_owned(),
        })?;
        Ok(Self(arr))
    }
}

impl Serialize for FilterHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FilterHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

use std::collections::BTreeSet;

use regex::Regex;
use skysift_core::filter::{FilterExpr, FilterHash, OnErrorPolicy};
use skysift_core::id::{Handle, Hashtag};
use skysift_core::time::Timestamp;
use snafu::Snafu;

/// Structural validation failed; the message is meant for users.
#[derive(Debug, Snafu)]
pub enum FilterCompileError {
    #[snafu(display("`{what}` must not be empty"))]
    EmptyCollection { what: &'static str },
    #[snafu(display("invalid regex `{pattern}`: {source}"))]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },
    #[snafu(display("dateRange start {start} is after end {end}"))]
    DateRangeInverted { start: Timestamp, end: Timestamp },
    #[snafu(display("engagement filter needs at least one of minLikes, minReposts, minReplies"))]
    EngagementWithoutThresholds,
    #[snafu(display("minImages must be at least 1"))]
    MinImagesZero,
    #[snafu(display("contains text must not be empty"))]
    EmptyContainsText,
    #[snafu(display("language tag must not be empty"))]
    EmptyLanguage,
    #[snafu(display("retry policy: baseDelay of {base_delay}ms exceeds the {max}ms limit"))]
    RetryDelayTooLong { base_delay: u64, max: u64 },
}

pub type FilterCompileResult<T> = Result<T, FilterCompileError>;

/// Upper bound on a retry policy's fixed delay. Anything longer would stall
/// a sync batch for minutes on a single post.
const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;

/// A validated expression ready for evaluation.
///
/// Keeps the source expression alongside the lowered tree so the signature
/// and the push-down planner keep working on the original shape.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub(crate) root: CompiledExpr,
    source: FilterExpr,
    hash: FilterHash,
    effectful: bool,
}

impl CompiledFilter {
    pub fn source(&self) -> &FilterExpr {
        &self.source
    }

    pub fn hash(&self) -> FilterHash {
        self.hash
    }

    pub fn is_effectful(&self) -> bool {
        self.effectful
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledExpr {
    All,
    None,
    And(Vec<CompiledExpr>),
    Or(Vec<CompiledExpr>),
    Not(Box<CompiledExpr>),
    Author(Handle),
    AuthorIn(BTreeSet<Handle>),
    Hashtag(Hashtag),
    HashtagIn(BTreeSet<Hashtag>),
    Contains {
        /// Original needle for case-sensitive matching.
        needle: String,
        /// Pre-lowered needle for the case-insensitive default.
        lowered: String,
        case_sensitive: bool,
    },
    IsReply,
    IsQuote,
    IsRepost,
    IsOriginal,
    Engagement {
        min_likes: Option<u64>,
        min_reposts: Option<u64>,
        min_replies: Option<u64>,
    },
    HasImages,
    MinImages(u32),
    HasAltText,
    NoAltText,
    AltText {
        lowered: String,
    },
    AltTextRegex(Regex),
    HasVideo,
    HasLinks,
    HasMedia,
    HasEmbed,
    Language(String),
    Regex(Vec<Regex>),
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

pub fn compile(expr: &FilterExpr) -> FilterCompileResult<CompiledFilter> {
    let root = lower(expr)?;
    Ok(CompiledFilter {
        root,
        source: expr.clone(),
        hash: expr.signature(),
        effectful: expr.is_effectful(),
    })
}

fn lower(expr: &FilterExpr) -> FilterCompileResult<CompiledExpr> {
    Ok(match expr {
        FilterExpr::All => CompiledExpr::All,
        FilterExpr::None => CompiledExpr::None,
        FilterExpr::And { exprs } => {
            if exprs.is_empty() {
                return EmptyCollectionSnafu { what: "and.exprs" }.fail();
            }
            CompiledExpr::And(exprs.iter().map(lower).collect::<Result<_, _>>()?)
        }
        FilterExpr::Or { exprs } => {
            if exprs.is_empty() {
                return EmptyCollectionSnafu { what: "or.exprs" }.fail();
            }
            CompiledExpr::Or(exprs.iter().map(lower).collect::<Result<_, _>>()?)
        }
        FilterExpr::Not { expr } => CompiledExpr::Not(Box::new(lower(expr)?)),
        FilterExpr::Author { handle } => CompiledExpr::Author(handle.clone()),
        FilterExpr::AuthorIn { handles } => {
            if handles.is_empty() {
                return EmptyCollectionSnafu {
                    what: "authorIn.handles",
                }
                .fail();
            }
            CompiledExpr::AuthorIn(handles.iter().cloned().collect())
        }
        FilterExpr::Hashtag { tag } => CompiledExpr::Hashtag(tag.clone()),
        FilterExpr::HashtagIn { tags } => {
            if tags.is_empty() {
                return EmptyCollectionSnafu {
                    what: "hashtagIn.tags",
                }
                .fail();
            }
            CompiledExpr::HashtagIn(tags.iter().cloned().collect())
        }
        FilterExpr::Contains {
            text,
            case_sensitive,
        } => {
            if text.is_empty() {
                return EmptyContainsTextSnafu.fail();
            }
            CompiledExpr::Contains {
                needle: text.clone(),
                lowered: text.to_lowercase(),
                case_sensitive: case_sensitive.unwrap_or(false),
            }
        }
        FilterExpr::IsReply => CompiledExpr::IsReply,
        FilterExpr::IsQuote => CompiledExpr::IsQuote,
        FilterExpr::IsRepost => CompiledExpr::IsRepost,
        FilterExpr::IsOriginal => CompiledExpr::IsOriginal,
        FilterExpr::Engagement {
            min_likes,
            min_reposts,
            min_replies,
        } => {
            if min_likes.is_none() && min_reposts.is_none() && min_replies.is_none() {
                return EngagementWithoutThresholdsSnafu.fail();
            }
            CompiledExpr::Engagement {
                min_likes: *min_likes,
                min_reposts: *min_reposts,
                min_replies: *min_replies,
            }
        }
        FilterExpr::HasImages => CompiledExpr::HasImages,
        FilterExpr::MinImages { min } => {
            if *min < 1 {
                return MinImagesZeroSnafu.fail();
            }
            CompiledExpr::MinImages(*min)
        }
        FilterExpr::HasAltText => CompiledExpr::HasAltText,
        FilterExpr::NoAltText => CompiledExpr::NoAltText,
        FilterExpr::AltText { text } => {
            if text.is_empty() {
                return EmptyContainsTextSnafu.fail();
            }
            CompiledExpr::AltText {
                lowered: text.to_lowercase(),
            }
        }
        FilterExpr::AltTextRegex { pattern } => {
            CompiledExpr::AltTextRegex(build_regex(pattern)?)
        }
        FilterExpr::HasVideo => CompiledExpr::HasVideo,
        FilterExpr::HasLinks => CompiledExpr::HasLinks,
        FilterExpr::HasMedia => CompiledExpr::HasMedia,
        FilterExpr::HasEmbed => CompiledExpr::HasEmbed,
        FilterExpr::Language { lang } => {
            if lang.is_empty() {
                return EmptyLanguageSnafu.fail();
            }
            CompiledExpr::Language(lang.to_ascii_lowercase())
        }
        FilterExpr::Regex { patterns } => {
            if patterns.is_empty() {
                return EmptyCollectionSnafu {
                    what: "regex.patterns",
                }
                .fail();
            }
            CompiledExpr::Regex(
                patterns
                    .iter()
                    .map(|p| build_regex(p))
                    .collect::<Result<_, _>>()?,
            )
        }
        FilterExpr::DateRange { start, end } => {
            if end < start {
                return DateRangeInvertedSnafu {
                    start: *start,
                    end: *end,
                }
                .fail();
            }
            CompiledExpr::DateRange {
                start: *start,
                end: *end,
            }
        }
        FilterExpr::HasValidLinks { on_error } => CompiledExpr::HasValidLinks {
            on_error: validate_policy(on_error)?,
        },
        FilterExpr::Trending { tag, on_error } => CompiledExpr::Trending {
            tag: tag.clone(),
            on_error: validate_policy(on_error)?,
        },
    })
}

fn build_regex(pattern: &str) -> FilterCompileResult<Regex> {
    Regex::new(pattern).map_err(|source| FilterCompileError::BadRegex {
        pattern: pattern.to_owned(),
        source,
    })
}

fn validate_policy(policy: &OnErrorPolicy) -> FilterCompileResult<OnErrorPolicy> {
    if let OnErrorPolicy::Retry { base_delay, .. } = policy {
        if MAX_RETRY_BASE_DELAY_MS < *base_delay {
            return RetryDelayTooLongSnafu {
                base_delay: *base_delay,
                max: MAX_RETRY_BASE_DELAY_MS,
            }
            .fail();
        }
    }
    Ok(policy.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_collections() {
        let err = compile(&FilterExpr::And { exprs: vec![] }).unwrap_err();
        assert!(err.to_string().contains("and.exprs"));

        assert!(compile(&FilterExpr::HashtagIn { tags: vec![] }).is_err());
        assert!(compile(&FilterExpr::Regex { patterns: vec![] }).is_err());
    }

    #[test]
    fn rejects_bad_regex() {
        let err = compile(&FilterExpr::Regex {
            patterns: vec!["[unclosed".to_owned()],
        })
        .unwrap_err();
        assert!(err.to_string().contains("[unclosed"));
    }

    #[test]
    fn rejects_inverted_date_range() {
        let start: Timestamp = "2024-06-01T00:00:00Z".parse().unwrap();
        let end: Timestamp = "2024-01-01T00:00:00Z".parse().unwrap();
        assert!(compile(&FilterExpr::DateRange { start, end }).is_err());
        // Equal bounds are valid (inclusive instant match).
        assert!(compile(&FilterExpr::DateRange {
            start,
            end: start
        })
        .is_ok());
    }

    #[test]
    fn rejects_empty_engagement_and_zero_min_images() {
        assert!(compile(&FilterExpr::Engagement {
            min_likes: None,
            min_reposts: None,
            min_replies: None,
        })
        .is_err());
        assert!(compile(&FilterExpr::MinImages { min: 0 }).is_err());
        assert!(compile(&FilterExpr::MinImages { min: 1 }).is_ok());
    }

    #[test]
    fn rejects_unreasonable_retry_delay() {
        let err = compile(&FilterExpr::HasValidLinks {
            on_error: OnErrorPolicy::Retry {
                max_retries: 3,
                base_delay: 600_000,
            },
        })
        .unwrap_err();
        assert!(err.to_string().contains("baseDelay"));
    }

    #[test]
    fn compiled_filter_keeps_identity() {
        let expr = FilterExpr::and(vec![
            FilterExpr::Hashtag {
                tag: "rust".parse().unwrap(),
            },
            FilterExpr::IsOriginal,
        ]);
        let compiled = compile(&expr).unwrap();
        assert_eq!(compiled.hash(), expr.signature());
        assert_eq!(compiled.source(), &expr);
        assert!(!compiled.is_effectful());
    }
}

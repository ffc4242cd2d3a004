use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable as _};
use futures::stream::{self, StreamExt as _};
use skysift_core::filter::OnErrorPolicy;
use skysift_core::id::Hashtag;
use skysift_core::post::Post;
use snafu::Snafu;
use tracing::debug;

use crate::compile::{CompiledExpr, CompiledFilter};
use crate::oracle::{OracleError, OracleResult, Oracles};
use crate::LOG_TARGET;

#[derive(Debug, Clone, Snafu)]
pub enum FilterEvalError {
    #[snafu(display("oracle call failed after retries: {source}"))]
    OracleExhausted { source: OracleError },
}

pub type FilterEvalResult<T> = Result<T, FilterEvalError>;

/// One oracle invocation made while evaluating a post.
#[derive(Debug, Clone)]
pub struct OracleCallRecord {
    pub oracle: &'static str,
    pub input: String,
    pub ok: Option<bool>,
    pub error: Option<String>,
    /// Attempts made, counting the first call.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub ok: bool,
    pub oracle_calls: Vec<OracleCallRecord>,
}

/// Deduplicates oracle lookups within one evaluation scope.
///
/// Each distinct lookup runs exactly once (including its retries); concurrent
/// evaluations of other posts in the same batch await the in-flight call
/// instead of issuing their own.
#[derive(Default)]
struct BatchMemo {
    cells: Mutex<HashMap<MemoKey, Arc<tokio::sync::OnceCell<OracleResult<bool>>>>>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum MemoKey {
    Links(Vec<String>),
    Trending(String),
}

impl BatchMemo {
    async fn get_or_call<F, Fut>(&self, key: MemoKey, call: F) -> OracleResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OracleResult<bool>>,
    {
        let cell = {
            let mut cells = self.cells.lock().expect("Locking failed");
            cells.entry(key).or_default().clone()
        };
        cell.get_or_init(call).await.clone()
    }
}

struct EvalCtx {
    memo: Arc<BatchMemo>,
    records: Mutex<Vec<OracleCallRecord>>,
}

impl EvalCtx {
    fn new(memo: Arc<BatchMemo>) -> Self {
        Self {
            memo,
            records: Mutex::new(Vec::new()),
        }
    }

    fn push_record(&self, record: OracleCallRecord) {
        self.records.lock().expect("Locking failed").push(record);
    }

    fn into_records(self) -> Vec<OracleCallRecord> {
        self.records.into_inner().expect("Locking failed")
    }
}

/// Evaluates a compiled filter against posts.
///
/// `And`/`Or` short-circuit left to right, so an expression like
/// `And(None, <oracle leaf>)` never touches the oracle.
pub struct FilterRuntime {
    filter: Arc<CompiledFilter>,
    oracles: Oracles,
    batch_concurrency: usize,
}

impl FilterRuntime {
    pub fn new(filter: CompiledFilter, oracles: Oracles) -> Self {
        Self {
            filter: Arc::new(filter),
            oracles,
            batch_concurrency: 8,
        }
    }

    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency.max(1);
        self
    }

    pub fn filter(&self) -> &CompiledFilter {
        &self.filter
    }

    pub async fn evaluate(&self, post: &Post) -> FilterEvalResult<bool> {
        let ctx = EvalCtx::new(Arc::new(BatchMemo::default()));
        self.eval(&self.filter.root, post, &ctx).await
    }

    pub async fn evaluate_with_metadata(&self, post: &Post) -> FilterEvalResult<EvalOutcome> {
        let ctx = EvalCtx::new(Arc::new(BatchMemo::default()));
        let ok = self.eval(&self.filter.root, post, &ctx).await?;
        Ok(EvalOutcome {
            ok,
            oracle_calls: ctx.into_records(),
        })
    }

    /// Order-preserving batch evaluation; the first evaluation error aborts
    /// the whole batch.
    pub async fn evaluate_batch(&self, posts: &[Post]) -> FilterEvalResult<Vec<bool>> {
        self.evaluate_batch_outcomes(posts)
            .await
            .into_iter()
            .map(|r| r.map(|o| o.ok))
            .collect()
    }

    /// Per-item results, order preserved. Oracle lookups are deduplicated
    /// across the batch and fanned out with bounded concurrency.
    pub async fn evaluate_batch_outcomes(
        &self,
        posts: &[Post],
    ) -> Vec<FilterEvalResult<EvalOutcome>> {
        if !self.filter.is_effectful() {
            let memo = Arc::new(BatchMemo::default());
            let mut out = Vec::with_capacity(posts.len());
            for post in posts {
                let ctx = EvalCtx::new(memo.clone());
                out.push(self.eval(&self.filter.root, post, &ctx).await.map(|ok| {
                    EvalOutcome {
                        ok,
                        oracle_calls: Vec::new(),
                    }
                }));
            }
            return out;
        }

        let memo = Arc::new(BatchMemo::default());
        stream::iter(posts)
            .map(|post| self.eval_one(memo.clone(), post))
            .buffered(self.batch_concurrency)
            .collect()
            .await
    }

    async fn eval_one(
        &self,
        memo: Arc<BatchMemo>,
        post: &Post,
    ) -> FilterEvalResult<EvalOutcome> {
        let ctx = EvalCtx::new(memo);
        let ok = self.eval(&self.filter.root, post, &ctx).await?;
        Ok(EvalOutcome {
            ok,
            oracle_calls: ctx.into_records(),
        })
    }

    fn eval<'a>(
        &'a self,
        expr: &'a CompiledExpr,
        post: &'a Post,
        ctx: &'a EvalCtx,
    ) -> Pin<Box<dyn Future<Output = FilterEvalResult<bool>> + Send + 'a>> {
        Box::pin(async move {
            Ok(match expr {
                CompiledExpr::All => true,
                CompiledExpr::None => false,
                CompiledExpr::And(exprs) => {
                    for e in exprs {
                        if !self.eval(e, post, ctx).await? {
                            return Ok(false);
                        }
                    }
                    true
                }
                CompiledExpr::Or(exprs) => {
                    for e in exprs {
                        if self.eval(e, post, ctx).await? {
                            return Ok(true);
                        }
                    }
                    false
                }
                CompiledExpr::Not(e) => !self.eval(e, post, ctx).await?,
                CompiledExpr::Author(handle) => post.author == *handle,
                CompiledExpr::AuthorIn(handles) => handles.contains(&post.author),
                CompiledExpr::Hashtag(tag) => post.hashtags.contains(tag),
                CompiledExpr::HashtagIn(tags) => post.hashtags.iter().any(|t| tags.contains(t)),
                CompiledExpr::Contains {
                    needle,
                    lowered,
                    case_sensitive,
                } => {
                    if *case_sensitive {
                        post.text.contains(needle.as_str())
                    } else {
                        post.text.to_lowercase().contains(lowered.as_str())
                    }
                }
                CompiledExpr::IsReply => post.is_reply(),
                CompiledExpr::IsQuote => post.is_quote(),
                CompiledExpr::IsRepost => post.is_repost(),
                CompiledExpr::IsOriginal => post.is_original(),
                CompiledExpr::Engagement {
                    min_likes,
                    min_reposts,
                    min_replies,
                } => {
                    let metrics = post.metrics.unwrap_or_default();
                    min_likes.is_none_or(|min| min <= metrics.like_count)
                        && min_reposts.is_none_or(|min| min <= metrics.repost_count)
                        && min_replies.is_none_or(|min| min <= metrics.reply_count)
                }
                CompiledExpr::HasImages => post.has_images(),
                CompiledExpr::MinImages(min) => *min as usize <= post.image_embeds().len(),
                CompiledExpr::HasAltText => post
                    .image_embeds()
                    .iter()
                    .any(|img| img.alt.as_deref().is_some_and(|alt| !alt.is_empty())),
                CompiledExpr::NoAltText => {
                    post.has_images()
                        && post
                            .image_embeds()
                            .iter()
                            .all(|img| img.alt.as_deref().is_none_or(str::is_empty))
                }
                CompiledExpr::AltText { lowered } => post.image_embeds().iter().any(|img| {
                    img.alt
                        .as_deref()
                        .is_some_and(|alt| alt.to_lowercase().contains(lowered.as_str()))
                }),
                CompiledExpr::AltTextRegex(re) => post
                    .image_embeds()
                    .iter()
                    .any(|img| img.alt.as_deref().is_some_and(|alt| re.is_match(alt))),
                CompiledExpr::HasVideo => post.has_video(),
                CompiledExpr::HasLinks => post.has_links(),
                CompiledExpr::HasMedia => post.has_media(),
                CompiledExpr::HasEmbed => post.has_embed(),
                CompiledExpr::Language(lang) => post.langs.as_deref().is_some_and(|langs| {
                    langs.iter().any(|tag| {
                        tag.eq_ignore_ascii_case(lang)
                            || tag
                                .split('-')
                                .next()
                                .is_some_and(|primary| primary.eq_ignore_ascii_case(lang))
                    })
                }),
                CompiledExpr::Regex(patterns) => {
                    patterns.iter().any(|re| re.is_match(&post.text))
                }
                CompiledExpr::DateRange { start, end } => {
                    *start <= post.created_at && post.created_at <= *end
                }
                CompiledExpr::HasValidLinks { on_error } => {
                    self.eval_has_valid_links(post, on_error, ctx).await?
                }
                CompiledExpr::Trending { tag, on_error } => {
                    self.eval_trending(post, tag, on_error, ctx).await?
                }
            })
        })
    }

    async fn eval_has_valid_links(
        &self,
        post: &Post,
        on_error: &OnErrorPolicy,
        ctx: &EvalCtx,
    ) -> FilterEvalResult<bool> {
        let urls: Vec<String> = post.all_links().iter().map(|s| (*s).to_owned()).collect();
        if urls.is_empty() {
            return Ok(false);
        }
        let mut key_urls = urls.clone();
        key_urls.sort_unstable();
        key_urls.dedup();
        let input = key_urls.join(" ");

        let oracles = self.oracles.clone();
        let call = move || {
            let oracles = oracles.clone();
            let urls = urls.clone();
            async move {
                let validator = oracles.link_validator()?.clone();
                let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
                validator.has_valid_link(&refs).await
            }
        };
        self.apply_policy(
            "link_validator",
            input,
            MemoKey::Links(key_urls),
            on_error,
            call,
            ctx,
        )
        .await
    }

    async fn eval_trending(
        &self,
        post: &Post,
        tag: &Hashtag,
        on_error: &OnErrorPolicy,
        ctx: &EvalCtx,
    ) -> FilterEvalResult<bool> {
        // A post that doesn't carry the tag can't match no matter what the
        // oracle says; skip the lookup entirely.
        if !post.hashtags.contains(tag) {
            return Ok(false);
        }
        let oracles = self.oracles.clone();
        let tag_owned = tag.clone();
        let call = move || {
            let oracles = oracles.clone();
            let tag = tag_owned.clone();
            async move {
                let trending = oracles.trending()?.clone();
                trending.is_trending(&tag).await
            }
        };
        self.apply_policy(
            "trending",
            tag.to_string(),
            MemoKey::Trending(tag.to_string()),
            on_error,
            call,
            ctx,
        )
        .await
    }

    async fn apply_policy<C, Fut>(
        &self,
        oracle: &'static str,
        input: String,
        key: MemoKey,
        on_error: &OnErrorPolicy,
        call: C,
        ctx: &EvalCtx,
    ) -> FilterEvalResult<bool>
    where
        C: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = OracleResult<bool>> + Send,
    {
        let attempts = Arc::new(AtomicU32::new(1));
        let result = match on_error {
            OnErrorPolicy::Retry {
                max_retries,
                base_delay,
            } => {
                let backoff = ConstantBuilder::default()
                    .with_delay(Duration::from_millis(*base_delay))
                    .with_max_times(*max_retries as usize);
                let attempts = attempts.clone();
                ctx.memo
                    .get_or_call(key, move || async move {
                        call.retry(backoff)
                            .notify(move |err: &OracleError, delay: Duration| {
                                attempts.fetch_add(1, Ordering::Relaxed);
                                debug!(
                                    target: LOG_TARGET,
                                    %oracle,
                                    err = %err,
                                    delay_ms = %delay.as_millis(),
                                    "Retrying oracle call"
                                );
                            })
                            .await
                    })
                    .await
            }
            OnErrorPolicy::Include | OnErrorPolicy::Exclude => {
                let mut call = call;
                ctx.memo.get_or_call(key, move || call()).await
            }
        };

        ctx.push_record(OracleCallRecord {
            oracle,
            input,
            ok: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(ToString::to_string),
            attempts: attempts.load(Ordering::Relaxed),
        });

        match result {
            Ok(v) => Ok(v),
            Err(err) => match on_error {
                OnErrorPolicy::Include => Ok(true),
                OnErrorPolicy::Exclude => Ok(false),
                OnErrorPolicy::Retry { .. } => Err(FilterEvalError::OracleExhausted { source: err }),
            },
        }
    }
}

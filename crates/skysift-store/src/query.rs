//! Query planning: predicate push-down plus in-memory residual filtering.
//!
//! The filter is decomposed into a conjunction. Leaves the database can
//! answer (`Author`, `AuthorIn`, `Hashtag`, `HashtagIn`, `DateRange`,
//! case-sensitive ASCII `Contains`) become SQL; whatever remains is
//! evaluated in memory, in batches, over the rows the SQL plan produced.
//! Results stream lazily with keyset pagination and are ordered by
//! `(created_at, uri)` so reruns are deterministic.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_stream::try_stream;
use futures::Stream;
use itertools::Itertools as _;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use skysift_core::filter::FilterExpr;
use skysift_core::post::Post;
use skysift_core::time::Timestamp;
use snafu::{ResultExt as _, Snafu};
use skysift_filter::{compile, FilterCompileError, FilterEvalError, FilterRuntime, Oracles};
use tracing::warn;

use crate::{StoreDb, StoreIoError, StoredJsonSnafu, LOG_TARGET};

/// Rows fetched per page; also the batch size for residual evaluation.
const SCAN_BATCH: u64 = 50;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub range: Option<(Timestamp, Timestamp)>,
    pub filter: Option<FilterExpr>,
    pub scan_limit: Option<u32>,
    pub order: SortOrder,
}

#[bon::bon]
impl StoreQuery {
    #[builder]
    pub fn new(
        range: Option<(Timestamp, Timestamp)>,
        filter: Option<FilterExpr>,
        scan_limit: Option<u32>,
        order: Option<SortOrder>,
    ) -> Self {
        Self {
            range,
            filter,
            scan_limit,
            order: order.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum QueryError {
    #[snafu(transparent)]
    Store { source: StoreIoError },
    #[snafu(transparent)]
    Compile { source: FilterCompileError },
    #[snafu(display("residual filter evaluation failed: {source}"))]
    Eval { source: FilterEvalError },
}

/// Scan/match accounting for one query run.
#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    /// Rows the SQL plan produced (before residual filtering).
    pub scanned: u64,
    /// Posts that passed the residual filter and were yielded.
    pub matched: u64,
    /// True when `scan_limit` stopped the scan early.
    pub clipped: bool,
    pub warnings: Vec<String>,
}

/// Lazy, restartable-per-call sequence of posts.
pub struct PostStream {
    inner: Pin<Box<dyn Stream<Item = Result<Post, QueryError>> + Send>>,
    stats: Arc<Mutex<QueryStats>>,
}

impl PostStream {
    /// Snapshot of the accounting so far. Final once the stream is drained.
    pub fn stats(&self) -> QueryStats {
        self.stats.lock().expect("Locking failed").clone()
    }
}

impl Stream for PostStream {
    type Item = Result<Post, QueryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[derive(Default)]
struct Plan {
    joins: Vec<String>,
    clauses: Vec<String>,
    params: Vec<SqlValue>,
    residual: Option<FilterExpr>,
    warnings: Vec<String>,
}

impl StoreDb {
    /// Plans and runs a query. The stream owns its cursor; collecting it
    /// twice re-runs the scan from the start.
    pub fn query(self: &Arc<Self>, query: StoreQuery, oracles: Oracles) -> PostStream {
        let db = self.clone();
        let stats = Arc::new(Mutex::new(QueryStats::default()));
        let stats_out = stats.clone();

        let stream = try_stream! {
            let plan = build_plan(&query);
            for warning in &plan.warnings {
                warn!(target: LOG_TARGET, store = %db.name(), %warning, "Query plan warning");
            }
            stats.lock().expect("Locking failed").warnings = plan.warnings.clone();

            let runtime = match &plan.residual {
                Some(expr) => Some(FilterRuntime::new(compile(expr)?, oracles.clone())),
                None => None,
            };

            let scan_limit = query.scan_limit.map(u64::from);
            let mut cursor: Option<(String, String)> = None;
            let mut scanned = 0u64;

            loop {
                let page = match scan_limit {
                    Some(limit) => SCAN_BATCH.min(limit.saturating_sub(scanned)),
                    None => SCAN_BATCH,
                };
                if page == 0 {
                    stats.lock().expect("Locking failed").clipped = true;
                    warn!(
                        target: LOG_TARGET,
                        store = %db.name(),
                        limit = ?scan_limit,
                        "Scan limit reached; results may be clipped"
                    );
                    break;
                }

                let cursor_ref = cursor.clone();
                let rows = db
                    .read_with(|conn| {
                        fetch_page(conn, &plan, query.order, cursor_ref.as_ref(), page)
                    })
                    .await?;
                if rows.is_empty() {
                    break;
                }
                scanned += rows.len() as u64;
                let last = rows.last().expect("non-empty");
                cursor = Some((last.0.clone(), last.1.clone()));
                let page_was_full = rows.len() as u64 == page;

                let posts: Vec<Post> = rows.into_iter().map(|(_, _, post)| post).collect();
                let keeps = match &runtime {
                    Some(rt) => rt
                        .evaluate_batch(&posts)
                        .await
                        .map_err(|source| QueryError::Eval { source })?,
                    None => vec![true; posts.len()],
                };

                {
                    let mut stats = stats.lock().expect("Locking failed");
                    stats.scanned = scanned;
                }
                for (post, keep) in posts.into_iter().zip(keeps) {
                    if keep {
                        stats.lock().expect("Locking failed").matched += 1;
                        yield post;
                    }
                }

                if !page_was_full {
                    break;
                }
            }
        };

        PostStream {
            inner: Box::pin(stream),
            stats: stats_out,
        }
    }

    /// Convenience: drain the stream into a vec plus final stats.
    pub async fn query_collect(
        self: &Arc<Self>,
        query: StoreQuery,
        oracles: Oracles,
    ) -> Result<(Vec<Post>, QueryStats), QueryError> {
        use futures::TryStreamExt as _;

        let stream = self.query(query, oracles);
        let stats_handle = stream.stats.clone();
        let posts: Vec<Post> = stream.try_collect().await?;
        let stats = stats_handle.lock().expect("Locking failed").clone();
        Ok((posts, stats))
    }
}

fn build_plan(query: &StoreQuery) -> Plan {
    let mut plan = Plan::default();

    if let Some((start, end)) = &query.range {
        plan.clauses
            .push("p.created_at BETWEEN ? AND ?".to_owned());
        plan.params.push(SqlValue::Text(start.to_sortable()));
        plan.params.push(SqlValue::Text(end.to_sortable()));
    }

    if let Some(filter) = &query.filter {
        let mut residual: Vec<FilterExpr> = Vec::new();
        for conjunct in flatten_and(filter) {
            if !try_push(conjunct, &mut plan) {
                residual.push(conjunct.clone());
            }
        }
        plan.residual = match residual.len() {
            0 => None,
            1 => residual.pop(),
            _ => Some(FilterExpr::And { exprs: residual }),
        };
    }

    plan
}

/// Flattens nested `And`s into one conjunct list. Anything else is a single
/// conjunct.
fn flatten_and(expr: &FilterExpr) -> Vec<&FilterExpr> {
    match expr {
        FilterExpr::And { exprs } => exprs.iter().flat_map(flatten_and).collect(),
        other => vec![other],
    }
}

/// Attempts to turn one conjunct into SQL. Returns false if it has to stay
/// in the residual.
fn try_push(expr: &FilterExpr, plan: &mut Plan) -> bool {
    match expr {
        FilterExpr::All => true, // vacuous conjunct
        FilterExpr::None => {
            plan.clauses.push("0 = 1".to_owned());
            true
        }
        FilterExpr::Author { handle } => {
            plan.clauses.push("p.author = ?".to_owned());
            plan.params.push(SqlValue::Text(handle.to_string()));
            true
        }
        FilterExpr::AuthorIn { handles } => {
            let placeholders = handles.iter().map(|_| "?").join(", ");
            plan.clauses.push(format!("p.author IN ({placeholders})"));
            plan.params
                .extend(handles.iter().map(|h| SqlValue::Text(h.to_string())));
            true
        }
        FilterExpr::Hashtag { tag } => {
            let alias = format!("ht{}", plan.joins.len());
            plan.joins.push(format!(
                "INNER JOIN post_hashtag {alias} ON {alias}.uri = p.uri"
            ));
            plan.clauses.push(format!("{alias}.tag = ?"));
            plan.params.push(SqlValue::Text(tag.to_string()));
            true
        }
        FilterExpr::HashtagIn { tags } => {
            let alias = format!("ht{}", plan.joins.len());
            plan.joins.push(format!(
                "INNER JOIN post_hashtag {alias} ON {alias}.uri = p.uri"
            ));
            let placeholders = tags.iter().map(|_| "?").join(", ");
            plan.clauses
                .push(format!("{alias}.tag IN ({placeholders})"));
            plan.params
                .extend(tags.iter().map(|t| SqlValue::Text(t.to_string())));
            true
        }
        FilterExpr::DateRange { start, end } => {
            plan.clauses
                .push("p.created_at BETWEEN ? AND ?".to_owned());
            plan.params.push(SqlValue::Text(start.to_sortable()));
            plan.params.push(SqlValue::Text(end.to_sortable()));
            true
        }
        FilterExpr::Contains {
            text,
            case_sensitive,
        } => {
            if case_sensitive.unwrap_or(false) && text.is_ascii() {
                // instr() is a byte search: exact, case-sensitive.
                plan.clauses
                    .push("instr(p.post_json ->> '$.text', ?) > 0".to_owned());
                plan.params.push(SqlValue::Text(text.clone()));
                true
            } else {
                plan.warnings.push(format!(
                    "contains(\"{text}\") is case-insensitive or non-ASCII and cannot \
                     be pushed down; filtering in memory"
                ));
                false
            }
        }
        _ => false,
    }
}

type PageRow = (String, String, Post);

fn fetch_page(
    conn: &Connection,
    plan: &Plan,
    order: SortOrder,
    cursor: Option<&(String, String)>,
    limit: u64,
) -> Result<Vec<PageRow>, StoreIoError> {
    let mut clauses = plan.clauses.clone();
    let mut params = plan.params.clone();

    if let Some((created_at, uri)) = cursor {
        let cmp = match order {
            SortOrder::Asc => ">",
            SortOrder::Desc => "<",
        };
        clauses.push(format!(
            "(p.created_at {cmp} ? OR (p.created_at = ? AND p.uri {cmp} ?))"
        ));
        params.push(SqlValue::Text(created_at.clone()));
        params.push(SqlValue::Text(created_at.clone()));
        params.push(SqlValue::Text(uri.clone()));
    }

    let direction = match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    let joins = plan.joins.join(" ");
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT DISTINCT p.created_at, p.uri, p.post_json FROM posts p {joins} {where_clause} \
         ORDER BY p.created_at {direction}, p.uri {direction} LIMIT {limit}"
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    rows.map(|row| {
        let (created_at, uri, post_json) = row?;
        let post: Post = serde_json::from_str(&post_json).context(StoredJsonSnafu)?;
        Ok((created_at, uri, post))
    })
    .collect()
}

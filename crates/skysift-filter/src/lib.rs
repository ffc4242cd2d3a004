//! Filter compilation and evaluation.
//!
//! [`compile`] turns a [`skysift_core::FilterExpr`] into a [`CompiledFilter`]
//! with structural constraints checked and regexes built once. The compiled
//! form evaluates posts one at a time or in order-preserving batches, calling
//! out to [`oracle`] capabilities for the effectful leaves.

pub mod cache;
mod compile;
mod eval;
pub mod oracle;

pub use compile::{compile, CompiledFilter, FilterCompileError, FilterCompileResult};
pub use eval::{EvalOutcome, FilterEvalError, FilterEvalResult, FilterRuntime, OracleCallRecord};
pub use oracle::{
    IdentityResolver, LinkValidator, OracleError, OracleResult, Oracles, TrendingTopics,
};

const LOG_TARGET: &str = "skysift::filter";

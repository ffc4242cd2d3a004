//! Oracle capability interfaces.
//!
//! Oracles are the external lookups effectful filter leaves depend on. The
//! runtime only sees these traits; real implementations (HTTP link checker,
//! trending feed, PLC directory) live with their transports, and tests plug
//! in fakes.

use std::sync::Arc;

use async_trait::async_trait;
use skysift_core::id::{Did, Handle, Hashtag};
use snafu::Snafu;

/// Oracle failure, cloneable so a deduplicated in-flight call can hand the
/// same error to every waiter.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum OracleError {
    #[snafu(display("oracle `{oracle}` is not configured"))]
    Unavailable { oracle: &'static str },
    #[snafu(display("oracle `{oracle}` failed: {message}"))]
    Failed { oracle: &'static str, message: String },
    #[snafu(display("identity `{identifier}` not found"))]
    NotFound { identifier: String },
}

pub type OracleResult<T> = Result<T, OracleError>;

#[async_trait]
pub trait LinkValidator: Send + Sync {
    async fn is_valid(&self, url: &str) -> OracleResult<bool>;

    /// True if any of the URLs validates. Sequential by default; cached or
    /// batched implementations can do better.
    async fn has_valid_link(&self, urls: &[&str]) -> OracleResult<bool> {
        for url in urls {
            if self.is_valid(url).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
pub trait TrendingTopics: Send + Sync {
    async fn is_trending(&self, tag: &Hashtag) -> OracleResult<bool>;
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_did(&self, handle: &Handle) -> OracleResult<Did>;
    async fn resolve_handle(&self, did: &Did) -> OracleResult<Handle>;

    /// Accepts either a DID or a handle.
    async fn resolve_identity(&self, identifier: &str) -> OracleResult<(Did, Handle)> {
        if let Ok(did) = identifier.parse::<Did>() {
            let handle = self.resolve_handle(&did).await?;
            return Ok((did, handle));
        }
        let handle: Handle = identifier.parse().map_err(|_| OracleError::NotFound {
            identifier: identifier.to_owned(),
        })?;
        let did = self.resolve_did(&handle).await?;
        Ok((did, handle))
    }
}

/// The oracle set handed to a filter runtime.
///
/// Unset oracles make the corresponding leaves fail with `Unavailable`,
/// which the leaf's `onError` policy then decides about.
#[derive(Clone, Default)]
pub struct Oracles {
    pub link_validator: Option<Arc<dyn LinkValidator>>,
    pub trending: Option<Arc<dyn TrendingTopics>>,
}

impl Oracles {
    /// No oracles at all: every effectful leaf resolves via its policy.
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn link_validator(&self) -> OracleResult<&Arc<dyn LinkValidator>> {
        self.link_validator.as_ref().ok_or(OracleError::Unavailable {
            oracle: "link_validator",
        })
    }

    pub(crate) fn trending(&self) -> OracleResult<&Arc<dyn TrendingTopics>> {
        self.trending.as_ref().ok_or(OracleError::Unavailable {
            oracle: "trending",
        })
    }
}

impl std::fmt::Debug for Oracles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracles")
            .field("link_validator", &self.link_validator.is_some())
            .field("trending", &self.trending.is_some())
            .finish()
    }
}

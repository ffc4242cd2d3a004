//! Caching layers for oracles.
//!
//! Two layers, mirroring how often each answer changes:
//!
//! - a bounded in-memory TTL cache for link validity and trending lookups
//!   (success 24 h, failure 5 min),
//! - a persistent redb-backed cache for identity resolution under
//!   `${dataRoot}/kv/identity.redb`, fronted by the same in-memory dedup.
//!
//! In-flight deduplication guarantees one lookup per key at a time: late
//! arrivals await the pending call instead of issuing their own.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use skysift_core::id::{Did, Handle, Hashtag};
use skysift_core::time::Timestamp;
use snafu::{Location, ResultExt as _, Snafu};
use tracing::debug;

use crate::oracle::{
    IdentityResolver, LinkValidator, OracleError, OracleResult, TrendingTopics,
};
use crate::LOG_TARGET;

pub const DEFAULT_SUCCESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(5 * 60);

/// Bounded map of values with per-entry expiry.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("Locking failed");
        match entries.get(key) {
            Some((value, deadline)) if Instant::now() < *deadline => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().expect("Locking failed");
        if self.capacity <= entries.len() && !entries.contains_key(&key) {
            let now = Instant::now();
            entries.retain(|_, (_, deadline)| now < *deadline);
            // Still full after dropping expired entries: evict an arbitrary
            // one rather than grow without bound.
            if self.capacity <= entries.len() {
                if let Some(k) = entries.keys().next().cloned() {
                    entries.remove(&k);
                }
            }
        }
        entries.insert(key, (value, Instant::now() + ttl));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("Locking failed").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One pending call per key; completed slots are dropped so the TTL cache
/// stays authoritative.
struct Inflight<K, V> {
    cells: Mutex<HashMap<K, Arc<tokio::sync::OnceCell<V>>>>,
}

impl<K, V> Default for Inflight<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Inflight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    async fn get_or_run<F, Fut>(&self, key: K, call: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut cells = self.cells.lock().expect("Locking failed");
            cells.entry(key.clone()).or_default().clone()
        };
        let value = cell.get_or_init(call).await.clone();
        let mut cells = self.cells.lock().expect("Locking failed");
        if cells
            .get(&key)
            .is_some_and(|existing| Arc::ptr_eq(existing, &cell))
        {
            cells.remove(&key);
        }
        value
    }
}

/// TTL-caching, deduplicating wrapper around a link validator.
pub struct CachedLinkValidator {
    inner: Arc<dyn LinkValidator>,
    cache: TtlCache<String, OracleResult<bool>>,
    inflight: Inflight<String, OracleResult<bool>>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl CachedLinkValidator {
    pub fn new(inner: Arc<dyn LinkValidator>) -> Self {
        Self::with_ttls(inner, DEFAULT_SUCCESS_TTL, DEFAULT_FAILURE_TTL)
    }

    pub fn with_ttls(
        inner: Arc<dyn LinkValidator>,
        success_ttl: Duration,
        failure_ttl: Duration,
    ) -> Self {
        Self {
            inner,
            cache: TtlCache::new(16_384),
            inflight: Inflight::default(),
            success_ttl,
            failure_ttl,
        }
    }

    fn ttl_for(&self, result: &OracleResult<bool>) -> Duration {
        if result.is_ok() {
            self.success_ttl
        } else {
            self.failure_ttl
        }
    }
}

#[async_trait]
impl LinkValidator for CachedLinkValidator {
    async fn is_valid(&self, url: &str) -> OracleResult<bool> {
        if let Some(cached) = self.cache.get(&url.to_owned()) {
            return cached;
        }
        let inner = self.inner.clone();
        let key = url.to_owned();
        let result = self
            .inflight
            .get_or_run(key.clone(), || {
                let inner = inner.clone();
                let url = key.clone();
                async move { inner.is_valid(&url).await }
            })
            .await;
        self.cache.insert(key, result.clone(), self.ttl_for(&result));
        result
    }
}

/// TTL-caching, deduplicating wrapper around a trending-topics oracle.
pub struct CachedTrendingTopics {
    inner: Arc<dyn TrendingTopics>,
    cache: TtlCache<Hashtag, OracleResult<bool>>,
    inflight: Inflight<Hashtag, OracleResult<bool>>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl CachedTrendingTopics {
    pub fn new(inner: Arc<dyn TrendingTopics>) -> Self {
        Self::with_ttls(inner, DEFAULT_SUCCESS_TTL, DEFAULT_FAILURE_TTL)
    }

    pub fn with_ttls(
        inner: Arc<dyn TrendingTopics>,
        success_ttl: Duration,
        failure_ttl: Duration,
    ) -> Self {
        Self {
            inner,
            cache: TtlCache::new(4_096),
            inflight: Inflight::default(),
            success_ttl,
            failure_ttl,
        }
    }
}

#[async_trait]
impl TrendingTopics for CachedTrendingTopics {
    async fn is_trending(&self, tag: &Hashtag) -> OracleResult<bool> {
        if let Some(cached) = self.cache.get(tag) {
            return cached;
        }
        let inner = self.inner.clone();
        let key = tag.clone();
        let result = self
            .inflight
            .get_or_run(key.clone(), || {
                let inner = inner.clone();
                let tag = key.clone();
                async move { inner.is_trending(&tag).await }
            })
            .await;
        let ttl = if result.is_ok() {
            self.success_ttl
        } else {
            self.failure_ttl
        };
        self.cache.insert(key, result.clone(), ttl);
        result
    }
}

#[derive(Debug, Snafu)]
pub enum IdentityCacheError {
    #[snafu(display("failed to open identity cache"))]
    Open {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type IdentityCacheResult<T> = Result<T, IdentityCacheError>;

macro_rules! def_kv_table {
    (
        $(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty
    ) => {
        #[allow(unused)]
        $(#[$outer])*
        pub(crate) mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_kv_table! {
    /// Handle → cached resolution outcome.
    identity_by_handle: String => IdentityCacheRecord
}

def_kv_table! {
    /// DID → cached resolution outcome.
    identity_by_did: String => IdentityCacheRecord
}

/// Both identity tables share one shape.
type IdentityTableDef = redb_bincode::TableDefinition<'static, String, IdentityCacheRecord>;

#[derive(Debug, Clone, Encode, Decode)]
pub struct IdentityCacheRecord {
    pub outcome: CachedOutcome,
    pub cached_at_micros: i64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub enum CachedOutcome {
    Resolved { did: String, handle: String },
    Failed { message: String },
}

impl IdentityCacheRecord {
    fn is_fresh(&self, success_ttl: Duration, failure_ttl: Duration) -> bool {
        let ttl = match self.outcome {
            CachedOutcome::Resolved { .. } => success_ttl,
            CachedOutcome::Failed { .. } => failure_ttl,
        };
        let age_micros = Timestamp::now().unix_micros() - self.cached_at_micros;
        age_micros >= 0 && (age_micros as u128) < ttl.as_micros()
    }

    fn to_result(&self) -> OracleResult<(Did, Handle)> {
        match &self.outcome {
            CachedOutcome::Resolved { did, handle } => {
                // Only validated values are ever written.
                match (did.parse(), handle.parse()) {
                    (Ok(did), Ok(handle)) => Ok((did, handle)),
                    _ => Err(OracleError::Failed {
                        oracle: "identity",
                        message: "corrupt cache record".to_owned(),
                    }),
                }
            }
            CachedOutcome::Failed { message } => Err(OracleError::Failed {
                oracle: "identity",
                message: message.clone(),
            }),
        }
    }
}

/// Identity resolver with a persistent cache and in-memory request dedup.
///
/// Lookups hit, in order: the redb tables (if fresh), the in-flight map, the
/// wrapped resolver. Results including failures are written back with the
/// appropriate TTL class.
pub struct CachingIdentityResolver {
    inner: Arc<dyn IdentityResolver>,
    db: redb_bincode::Database,
    inflight: Inflight<String, OracleResult<(Did, Handle)>>,
    success_ttl: Duration,
    failure_ttl: Duration,
}

impl CachingIdentityResolver {
    pub fn open(
        inner: Arc<dyn IdentityResolver>,
        path: impl AsRef<Path>,
    ) -> IdentityCacheResult<Self> {
        let db = redb::Database::create(path.as_ref()).context(OpenSnafu)?;
        let db = redb_bincode::Database::from(db);
        // Make sure the tables exist before the first read.
        {
            let tx = db.begin_write().context(TransactionSnafu)?;
            tx.open_table(&identity_by_handle::TABLE)?;
            tx.open_table(&identity_by_did::TABLE)?;
            tx.commit().context(CommitSnafu)?;
        }
        Ok(Self {
            inner,
            db,
            inflight: Inflight::default(),
            success_ttl: DEFAULT_SUCCESS_TTL,
            failure_ttl: DEFAULT_FAILURE_TTL,
        })
    }

    pub fn with_ttls(mut self, success_ttl: Duration, failure_ttl: Duration) -> Self {
        self.success_ttl = success_ttl;
        self.failure_ttl = failure_ttl;
        self
    }

    fn read_record(
        &self,
        table: &IdentityTableDef,
        key: &str,
    ) -> IdentityCacheResult<Option<IdentityCacheRecord>> {
        tokio::task::block_in_place(|| {
            let tx = self.db.begin_read().context(TransactionSnafu)?;
            let table = tx.open_table(table)?;
            Ok(table.get(&key.to_owned())?.map(|g| g.value()))
        })
    }

    fn write_outcome(
        &self,
        handle_key: Option<&str>,
        did_key: Option<&str>,
        outcome: CachedOutcome,
    ) -> IdentityCacheResult<()> {
        let record = IdentityCacheRecord {
            outcome,
            cached_at_micros: Timestamp::now().unix_micros(),
        };
        tokio::task::block_in_place(|| {
            let tx = self.db.begin_write().context(TransactionSnafu)?;
            {
                let mut by_handle = tx.open_table(&identity_by_handle::TABLE)?;
                let mut by_did = tx.open_table(&identity_by_did::TABLE)?;
                if let Some(handle) = handle_key {
                    by_handle.insert(&handle.to_owned(), &record)?;
                }
                if let Some(did) = did_key {
                    by_did.insert(&did.to_owned(), &record)?;
                }
            }
            tx.commit().context(CommitSnafu)?;
            Ok(())
        })
    }

    async fn resolve_cached(
        &self,
        table: &IdentityTableDef,
        key: String,
    ) -> OracleResult<(Did, Handle)> {
        match self.read_record(table, &key) {
            Ok(Some(record)) if record.is_fresh(self.success_ttl, self.failure_ttl) => {
                return record.to_result();
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: LOG_TARGET, err = %err, %key, "Identity cache read failed");
            }
        }

        let inner = self.inner.clone();
        let lookup_key = key.clone();
        let result = self
            .inflight
            .get_or_run(key, || async move {
                inner.resolve_identity(&lookup_key).await
            })
            .await;

        let outcome = match &result {
            Ok((did, handle)) => CachedOutcome::Resolved {
                did: did.to_string(),
                handle: handle.to_string(),
            },
            Err(err) => CachedOutcome::Failed {
                message: err.to_string(),
            },
        };
        let (handle_key, did_key) = match &result {
            Ok((did, handle)) => (Some(handle.to_string()), Some(did.to_string())),
            Err(_) => (None, None),
        };
        if let Err(err) = self.write_outcome(
            handle_key.as_deref(),
            did_key.as_deref(),
            outcome,
        ) {
            debug!(target: LOG_TARGET, err = %err, "Identity cache write failed");
        }
        result
    }
}

#[async_trait]
impl IdentityResolver for CachingIdentityResolver {
    async fn resolve_did(&self, handle: &Handle) -> OracleResult<Did> {
        self.resolve_cached(&identity_by_handle::TABLE, handle.to_string())
            .await
            .map(|(did, _)| did)
    }

    async fn resolve_handle(&self, did: &Did) -> OracleResult<Handle> {
        self.resolve_cached(&identity_by_did::TABLE, did.to_string())
            .await
            .map(|(_, handle)| handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn ttl_cache_expires_and_bounds() {
        let cache: TtlCache<String, u32> = TtlCache::new(2);
        cache.insert("a".to_owned(), 1, Duration::from_secs(60));
        cache.insert("b".to_owned(), 2, Duration::ZERO);
        assert_eq!(cache.get(&"a".to_owned()), Some(1));
        assert_eq!(cache.get(&"b".to_owned()), None);

        cache.insert("c".to_owned(), 3, Duration::from_secs(60));
        cache.insert("d".to_owned(), 4, Duration::from_secs(60));
        assert!(cache.len() <= 2);
    }

    struct CountingResolver {
        calls: AtomicU32,
    }

    #[async_trait]
    impl IdentityResolver for CountingResolver {
        async fn resolve_did(&self, _handle: &Handle) -> OracleResult<Did> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("did:plc:resolved".parse().unwrap())
        }

        async fn resolve_handle(&self, _did: &Did) -> OracleResult<Handle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("resolved.test".parse().unwrap())
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn identity_cache_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.redb");
        let handle: Handle = "alice.test".parse().unwrap();

        let inner = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        {
            let resolver = CachingIdentityResolver::open(inner.clone(), &path).unwrap();
            let did = resolver.resolve_did(&handle).await.unwrap();
            assert_eq!(did.as_str(), "did:plc:resolved");
            // Second lookup served from the persistent cache.
            resolver.resolve_did(&handle).await.unwrap();
            assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        }

        let resolver = CachingIdentityResolver::open(inner.clone(), &path).unwrap();
        resolver.resolve_did(&handle).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn identity_failures_expire_quickly() {
        struct FlakyResolver {
            calls: AtomicU32,
        }

        #[async_trait]
        impl IdentityResolver for FlakyResolver {
            async fn resolve_did(&self, _handle: &Handle) -> OracleResult<Did> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(OracleError::Failed {
                        oracle: "identity",
                        message: "transient".to_owned(),
                    })
                } else {
                    Ok("did:plc:late".parse().unwrap())
                }
            }

            async fn resolve_handle(&self, _did: &Did) -> OracleResult<Handle> {
                Ok("late.test".parse().unwrap())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(FlakyResolver {
            calls: AtomicU32::new(0),
        });
        let resolver =
            CachingIdentityResolver::open(inner.clone(), dir.path().join("identity.redb"))
                .unwrap()
                .with_ttls(DEFAULT_SUCCESS_TTL, Duration::ZERO);

        let handle: Handle = "bob.test".parse().unwrap();
        assert!(resolver.resolve_did(&handle).await.is_err());
        // Zero failure TTL: the next call retries the inner resolver.
        assert!(resolver.resolve_did(&handle).await.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}

//! Cached resolution of auxiliary facts (group members, artifact owners).
//!
//! The [`Requester`] fronts a set of pluggable [`FactBackend`]s, one per
//! [`LookupKind`], with a moka TTL cache keyed by `(kind, key)`:
//!
//! - concurrent misses on the same key coalesce into a single fetch
//! - every fetch is bounded by a timeout and a timeout is a lookup failure
//! - messages that signal a fact changed evict exactly the signalled keys
//! - a fetch that was running when its key was invalidated is discarded
//!
//! ```ignore
//! let requester = Requester::new(RequesterSettings::default())
//!     .with_backend(Arc::new(StaticFactBackend::new(LookupKind::GroupMembers, facts)));
//!
//! let members = requester.resolve(LookupKind::GroupMembers, "packagers").await?;
//! ```

mod backend;
mod http;
mod static_facts;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::config::{ServiceConfig, ServicesConfig};
use crate::error::{ConfigError, EvalError, LookupError};
use crate::message::{Artifact, Message};
use crate::topic::TopicPattern;

pub use backend::{FactBackend, InvalidationPolicy};
pub use http::HttpFactBackend;
pub use static_facts::StaticFactBackend;

/// Default time-to-live of a cached fact.
pub const DEFAULT_FACT_TTL: Duration = Duration::from_secs(3600);

/// Default upper bound on cached facts.
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// Default bound on a single backend fetch.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetches discarded in a row because of invalidations before the last
/// result is returned as is.
const MAX_STALE_REFETCHES: usize = 3;

/// The kind of fact being looked up. Selects the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    /// Members of a group, keyed by group name.
    GroupMembers,
    /// Artifacts a user has commit access to, keyed by username.
    UserArtifacts,
    /// Artifacts a group has commit access to, keyed by group name.
    GroupArtifacts,
}

impl LookupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupKind::GroupMembers => "group_members",
            LookupKind::UserArtifacts => "user_artifacts",
            LookupKind::GroupArtifacts => "group_artifacts",
        }
    }

    /// Keys named by a message that signals this kind of fact changed.
    pub fn signalled_keys(&self, message: &Message) -> Vec<String> {
        match self {
            LookupKind::GroupMembers | LookupKind::GroupArtifacts => {
                message.groups.iter().cloned().collect()
            }
            LookupKind::UserArtifacts => message.usernames.iter().cloned().collect(),
        }
    }

    /// The fact returned when a backend knows nothing about a key.
    pub fn empty_fact(&self) -> Fact {
        match self {
            LookupKind::GroupMembers => Fact::Names(BTreeSet::new()),
            LookupKind::UserArtifacts | LookupKind::GroupArtifacts => {
                Fact::Artifacts(BTreeSet::new())
            }
        }
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fact {
    Names(BTreeSet<String>),
    Artifacts(BTreeSet<Artifact>),
}

impl Fact {
    pub fn names(&self) -> Result<&BTreeSet<String>, EvalError> {
        match self {
            Fact::Names(names) => Ok(names),
            Fact::Artifacts(_) => Err(EvalError::Predicate {
                predicate: "requester".to_string(),
                message: "expected a list of names, got artifacts".to_string(),
            }),
        }
    }

    pub fn artifacts(&self) -> Result<&BTreeSet<Artifact>, EvalError> {
        match self {
            Fact::Artifacts(artifacts) => Ok(artifacts),
            Fact::Names(_) => Err(EvalError::Predicate {
                predicate: "requester".to_string(),
                message: "expected a list of artifacts, got names".to_string(),
            }),
        }
    }
}

/// Cache and timeout settings for the requester.
#[derive(Debug, Clone)]
pub struct RequesterSettings {
    pub ttl: Duration,
    pub max_capacity: u64,
    pub timeout: Duration,
}

impl Default for RequesterSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_FACT_TTL,
            max_capacity: DEFAULT_MAX_CAPACITY,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

type CacheKey = (LookupKind, String);

/// A resolved fact with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactEntry {
    pub fact: Arc<Fact>,
    /// When the fetch that produced this fact completed.
    pub fetched_at: Instant,
    /// Invalidation generation observed when the fetch started.
    generation: u64,
}

impl FactEntry {
    /// An entry no invalidation has raced with.
    pub fn new(fact: Arc<Fact>, fetched_at: Instant) -> Self {
        Self {
            fact,
            fetched_at,
            generation: 0,
        }
    }
}

/// Resolves and caches facts. Shared by every in-flight message.
pub struct Requester {
    backends: HashMap<LookupKind, Arc<dyn FactBackend>>,
    cache: Cache<CacheKey, FactEntry>,
    /// Generation at which each key was last invalidated.
    invalidations: Cache<CacheKey, u64>,
    generation: Arc<AtomicU64>,
    ttl: Duration,
    timeout: Duration,
}

impl Requester {
    pub fn new(settings: RequesterSettings) -> Self {
        let cache = Cache::builder()
            .time_to_live(settings.ttl)
            .max_capacity(settings.max_capacity)
            .build();
        // A fact fetched before an invalidation is cached at most ttl + timeout
        // after it; the record must outlive it.
        let invalidations = Cache::builder()
            .time_to_live(settings.ttl.saturating_add(settings.timeout))
            .max_capacity(settings.max_capacity)
            .build();

        Self {
            backends: HashMap::new(),
            cache,
            invalidations,
            generation: Arc::new(AtomicU64::new(0)),
            ttl: settings.ttl,
            timeout: settings.timeout,
        }
    }

    /// Register a backend. A later backend for the same kind replaces the earlier one.
    pub fn with_backend(mut self, backend: Arc<dyn FactBackend>) -> Self {
        let kind = backend.kind();
        if self.backends.insert(kind, backend).is_some() {
            tracing::warn!(kind = %kind, "Replacing previously registered fact backend");
        }
        self
    }

    /// Build a requester with one backend per configured service.
    ///
    /// # Errors
    /// Every service that fails to build.
    pub fn from_config(
        settings: RequesterSettings,
        services: &ServicesConfig,
        client: reqwest::Client,
    ) -> Result<Self, Vec<ConfigError>> {
        let mut requester = Self::new(settings);
        let mut errors = Vec::new();

        for (kind, service) in services {
            match Self::create_backend(*kind, service, &client) {
                Ok(backend) => {
                    tracing::debug!(kind = %kind, "Registered fact backend");
                    requester = requester.with_backend(backend);
                }
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(requester)
        } else {
            Err(errors)
        }
    }

    fn create_backend(
        kind: LookupKind,
        service: &ServiceConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn FactBackend>, ConfigError> {
        match service {
            ServiceConfig::Http(cfg) => Ok(Arc::new(HttpFactBackend::from_config(
                kind,
                cfg,
                client.clone(),
            )?)),
            ServiceConfig::Static(cfg) => {
                let topics = TopicPattern::compile_all(&cfg.invalidate_topics)?;
                Ok(Arc::new(
                    StaticFactBackend::from_entries(kind, &cfg.facts)?
                        .with_policy(InvalidationPolicy::new(topics)),
                ))
            }
        }
    }

    /// Kinds with a registered backend.
    pub fn kinds(&self) -> impl Iterator<Item = LookupKind> + '_ {
        self.backends.keys().copied()
    }

    /// How long a fetched fact may be served from cache.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached fact for `(kind, key)` or fetch it.
    ///
    /// # Errors
    ///
    /// [`EvalError::LookupFailed`] when no backend serves `kind`, the fetch
    /// fails or the fetch exceeds the configured timeout.
    pub async fn resolve(&self, kind: LookupKind, key: &str) -> Result<Arc<Fact>, EvalError> {
        self.resolve_entry(kind, key).await.map(|entry| entry.fact)
    }

    /// Like [`Requester::resolve`], keeping the fetch time of the fact.
    ///
    /// # Errors
    /// Same as [`Requester::resolve`].
    pub async fn resolve_entry(&self, kind: LookupKind, key: &str) -> Result<FactEntry, EvalError> {
        let backend = match self.backends.get(&kind) {
            Some(b) => Arc::clone(b),
            None => return Err(lookup_failed(kind, key, &LookupError::NoBackend(kind))),
        };
        let cache_key = (kind, key.to_string());

        for _ in 0..MAX_STALE_REFETCHES {
            let entry = self.get_or_fetch(&backend, &cache_key).await?;
            let invalidated = self
                .invalidations
                .get(&cache_key)
                .await
                .is_some_and(|generation| generation > entry.generation);
            // Moka may still serve an entry right at its TTL.
            let expired = entry.fetched_at.elapsed() >= self.ttl;
            if !invalidated && !expired {
                return Ok(entry);
            }
            if invalidated {
                tracing::debug!(
                    kind = %kind,
                    key = %key,
                    "Discarding fact fetched before its invalidation"
                );
            }
            self.cache.invalidate(&cache_key).await;
        }

        self.get_or_fetch(&backend, &cache_key).await
    }

    async fn get_or_fetch(
        &self,
        backend: &Arc<dyn FactBackend>,
        cache_key: &CacheKey,
    ) -> Result<FactEntry, EvalError> {
        let (kind, key) = cache_key.clone();
        let backend = Arc::clone(backend);
        let generation = Arc::clone(&self.generation);
        let timeout = self.timeout;

        self.cache
            .try_get_with(cache_key.clone(), async move {
                let started = generation.load(Ordering::Acquire);
                tracing::debug!(kind = %kind, key = %key, "Fetching fact");
                metrics::counter!("herald_requester_fetches_total", "kind" => kind.as_str())
                    .increment(1);
                match tokio::time::timeout(timeout, backend.fetch(&key)).await {
                    Ok(Ok(fact)) => Ok(FactEntry {
                        fact: Arc::new(fact),
                        fetched_at: Instant::now(),
                        generation: started,
                    }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(LookupError::Timeout(timeout)),
                }
            })
            .await
            .map_err(|e| {
                metrics::counter!("herald_lookup_failures_total", "kind" => kind.as_str())
                    .increment(1);
                lookup_failed(kind, &cache_key.1, &e)
            })
    }

    /// The cached fact for `(kind, key)`, without fetching.
    pub async fn cached(&self, kind: LookupKind, key: &str) -> Option<Arc<Fact>> {
        self.cache
            .get(&(kind, key.to_string()))
            .await
            .map(|entry| entry.fact)
    }

    /// Evict a single cached fact, including one still being fetched.
    pub async fn invalidate(&self, kind: LookupKind, key: &str) {
        self.invalidate_key((kind, key.to_string())).await;
    }

    async fn invalidate_key(&self, cache_key: CacheKey) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.invalidations.insert(cache_key.clone(), generation).await;
        self.cache.invalidate(&cache_key).await;
    }

    /// True if any backend considers a fact stale because of this message.
    pub fn signals_staleness(&self, message: &Message) -> bool {
        self.backends
            .values()
            .any(|b| !b.invalidation_signal(message).is_empty())
    }

    /// Evict the facts this message signals as stale. Returns the number of keys evicted.
    pub async fn invalidate_on_message(&self, message: &Message) -> usize {
        let mut evicted = 0;
        for (kind, backend) in &self.backends {
            for key in backend.invalidation_signal(message) {
                tracing::debug!(
                    kind = %kind,
                    key = %key,
                    message_id = %message.id,
                    "Invalidating cached fact"
                );
                self.invalidate_key((*kind, key)).await;
                metrics::counter!("herald_requester_invalidations_total", "kind" => kind.as_str())
                    .increment(1);
                evicted += 1;
            }
        }
        evicted
    }
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("cache_entry_count", &self.cache.entry_count())
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn lookup_failed(kind: LookupKind, key: &str, error: &LookupError) -> EvalError {
    EvalError::LookupFailed {
        kind,
        key: key.to_string(),
        message: error.to_string(),
    }
}

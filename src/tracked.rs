//! Tracked-criteria pre-filter and the rule snapshot it belongs to.
//!
//! Most messages concern nothing any rule tracks. Before evaluating every
//! rule, the dispatcher asks the current [`Snapshot`] whether a message is a
//! candidate at all. A snapshot pairs a compiled [`RuleSet`] with the
//! [`TrackedCriteria`] primed from it, so a message is always evaluated
//! against the rules its pre-filter was built from.
//!
//! Snapshots are published through an `ArcSwapOption`: readers take an
//! `Arc<Snapshot>` and keep it for the whole message, whatever happens to
//! the cache meanwhile. Invalidation only bumps an epoch; the next reader
//! rebuilds, one rebuild at a time.
//!
//! A snapshot primed from fetched facts expires with the oldest of them,
//! one requester TTL after its fetch started. Facts that change without a
//! message announcing it are picked up within that TTL.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;

use crate::error::RepositoryError;
use crate::message::{Artifact, ArtifactKind, Message};
use crate::requester::{FactEntry, Requester};
use crate::rules::{RuleSet, RuleSetLoader};
use crate::topic::{TopicPattern, any_matches};

/// Values at least one rule tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedCriteria {
    pub packages: BTreeSet<String>,
    pub containers: BTreeSet<String>,
    pub modules: BTreeSet<String>,
    pub flatpaks: BTreeSet<String>,
    /// Users a message may concern.
    pub usernames: BTreeSet<String>,
    /// Users whose actions are followed.
    pub agent_names: BTreeSet<String>,
    /// Some rule may match any message.
    pub everything: bool,
    /// Fetch time of the oldest fact these criteria were primed from.
    pub oldest_fact: Option<Instant>,
}

impl TrackedCriteria {
    pub fn artifacts(&self, kind: ArtifactKind) -> &BTreeSet<String> {
        match kind {
            ArtifactKind::Packages => &self.packages,
            ArtifactKind::Containers => &self.containers,
            ArtifactKind::Modules => &self.modules,
            ArtifactKind::Flatpaks => &self.flatpaks,
        }
    }

    pub fn artifacts_mut(&mut self, kind: ArtifactKind) -> &mut BTreeSet<String> {
        match kind {
            ArtifactKind::Packages => &mut self.packages,
            ArtifactKind::Containers => &mut self.containers,
            ArtifactKind::Modules => &mut self.modules,
            ArtifactKind::Flatpaks => &mut self.flatpaks,
        }
    }

    pub fn add_artifact(&mut self, artifact: &Artifact) {
        self.artifacts_mut(artifact.kind)
            .insert(artifact.name.clone());
    }

    /// Record that a fetched fact went into these criteria.
    pub fn note_fact(&mut self, entry: &FactEntry) {
        self.oldest_fact = Some(match self.oldest_fact {
            Some(oldest) => oldest.min(entry.fetched_at),
            None => entry.fetched_at,
        });
    }

    /// Could any rule match this message?
    pub fn is_candidate(&self, message: &Message) -> bool {
        self.everything
            || ArtifactKind::ALL
                .iter()
                .any(|kind| !message.artifacts(*kind).is_disjoint(self.artifacts(*kind)))
            || !message.usernames.is_disjoint(&self.usernames)
            || message
                .agent()
                .is_some_and(|agent| self.agent_names.contains(agent))
    }

    /// Number of tracked values across all sets.
    pub fn len(&self) -> usize {
        ArtifactKind::ALL
            .iter()
            .map(|kind| self.artifacts(*kind).len())
            .sum::<usize>()
            + self.usernames.len()
            + self.agent_names.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.everything && self.len() == 0
    }
}

/// Prime the criteria from every rule in the set.
///
/// A rule whose predicate cannot be primed (a fact lookup failed) makes the
/// criteria track everything, so that no message it could match is dropped.
pub async fn prime_criteria(rules: &RuleSet, requester: &Requester) -> TrackedCriteria {
    let mut tracked = TrackedCriteria::default();

    for rule in rules.rules() {
        if let Err(e) = rule.tracking.prime(requester, &mut tracked).await {
            tracing::warn!(
                rule_id = rule.id,
                predicate = rule.tracking.name(),
                error = %e,
                "Failed to prime tracked criteria, tracking everything"
            );
            metrics::counter!("herald_tracked_prime_failures_total").increment(1);
            tracked.everything = true;
        }
    }

    tracked
}

/// When snapshots go stale besides explicit invalidation.
#[derive(Debug, Clone, Default)]
pub struct TrackedSettings {
    /// Topics announcing that rules changed.
    pub rule_change_topics: Vec<TopicPattern>,
    /// Rebuild snapshots older than this.
    pub max_age: Option<Duration>,
}

/// An immutable rule set and the criteria primed from it.
#[derive(Debug)]
pub struct Snapshot {
    pub epoch: u64,
    pub rules: Arc<RuleSet>,
    pub tracked: TrackedCriteria,
    pub built_at: Instant,
}

/// Holds the current [`Snapshot`] and rebuilds it lazily.
pub struct TrackedCache {
    loader: RuleSetLoader,
    settings: TrackedSettings,
    current: ArcSwapOption<Snapshot>,
    epoch: AtomicU64,
    rebuild: Mutex<()>,
}

impl TrackedCache {
    pub fn new(loader: RuleSetLoader, settings: TrackedSettings) -> Self {
        Self {
            loader,
            settings,
            current: ArcSwapOption::empty(),
            epoch: AtomicU64::new(0),
            rebuild: Mutex::new(()),
        }
    }

    pub fn loader(&self) -> &RuleSetLoader {
        &self.loader
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The published snapshot, fresh or not.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    /// Mark the current snapshot stale.
    pub fn invalidate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!("herald_tracked_invalidations_total").increment(1);
        tracing::debug!(epoch, "Tracked criteria invalidated");
    }

    /// Invalidate if the message announces a rule change or makes a cached
    /// fact stale. Returns whether it did.
    pub fn invalidate_on_message(&self, message: &Message, requester: &Requester) -> bool {
        let rule_change = any_matches(&self.settings.rule_change_topics, &message.topic);
        if rule_change || requester.signals_staleness(message) {
            tracing::debug!(
                message_id = %message.id,
                topic = %message.topic,
                rule_change,
                "Message invalidates tracked criteria"
            );
            self.invalidate();
            true
        } else {
            false
        }
    }

    fn is_fresh(&self, snapshot: &Snapshot, requester: &Requester) -> bool {
        snapshot.epoch == self.epoch()
            && self
                .settings
                .max_age
                .is_none_or(|max_age| snapshot.built_at.elapsed() < max_age)
            && snapshot
                .tracked
                .oldest_fact
                .is_none_or(|fetched_at| fetched_at.elapsed() < requester.ttl())
    }

    /// The current snapshot, rebuilt first if stale: invalidated, older
    /// than `max_age`, or primed from a fact past the requester TTL.
    ///
    /// Concurrent callers share one rebuild. Snapshots already handed out
    /// stay valid for their holders.
    ///
    /// # Errors
    /// Returns the repository error if rules cannot be loaded. The cache
    /// stays stale and the next call retries.
    pub async fn get_tracked(&self, requester: &Requester) -> Result<Arc<Snapshot>, RepositoryError> {
        if let Some(snapshot) = self.current.load_full()
            && self.is_fresh(&snapshot, requester)
        {
            return Ok(snapshot);
        }

        let _guard = self.rebuild.lock().await;

        // Another caller may have rebuilt while we waited.
        if let Some(snapshot) = self.current.load_full()
            && self.is_fresh(&snapshot, requester)
        {
            return Ok(snapshot);
        }

        // Read the epoch first: an invalidation racing the rebuild leaves
        // the new snapshot stale.
        let epoch = self.epoch();
        let start = Instant::now();
        let rules = self.loader.load().await?;
        let tracked = prime_criteria(&rules, requester).await;

        tracing::info!(
            epoch,
            rules = rules.len(),
            rejected = rules.rejected(),
            tracked_values = tracked.len(),
            everything = tracked.everything,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tracked criteria rebuilt"
        );
        metrics::counter!("herald_tracked_rebuilds_total").increment(1);
        metrics::histogram!("herald_tracked_rebuild_seconds").record(start.elapsed().as_secs_f64());

        let snapshot = Arc::new(Snapshot {
            epoch,
            rules: Arc::new(rules),
            tracked,
            built_at: Instant::now(),
        });
        self.current.store(Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }
}

impl fmt::Debug for TrackedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.load();
        f.debug_struct("TrackedCache")
            .field("epoch", &self.epoch())
            .field("snapshot_epoch", &current.as_ref().map(|s| s.epoch))
            .field("settings", &self.settings)
            .finish()
    }
}

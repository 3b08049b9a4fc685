//! Name-keyed registry of tracking predicates and filters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::filters::{Applications, Filter, MyActions, Muted, Severities, Topic};
use super::tracking::{
    ArtifactNames, ArtifactsFollowed, ArtifactsGroupOwned, ArtifactsOwned, Everything,
    GroupMembersFollowed, RelatedEvents, TrackingPredicate, UsersFollowed,
};
use crate::error::ConfigError;
use crate::message::ArtifactKind;

/// Builds a tracking predicate from its params.
pub type TrackingFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn TrackingPredicate>, String> + Send + Sync>;

/// Builds a filter from its params.
pub type FilterFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn Filter>, String> + Send + Sync>;

/// Registry mapping rule vocabulary to implementations.
///
/// Rules name their tracking predicate and filters; anything not registered
/// here is a configuration error when the rule is loaded.
#[derive(Clone)]
pub struct PredicateRegistry {
    tracking: HashMap<String, TrackingFactory>,
    filters: HashMap<String, FilterFactory>,
}

impl PredicateRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tracking: HashMap::new(),
            filters: HashMap::new(),
        }
    }

    /// Registry with every built-in predicate and filter.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        for kind in ArtifactKind::ALL {
            registry.insert_tracking(kind.as_str(), move |p| {
                ArtifactNames::from_params(kind, p).map(boxed_tracking)
            });
        }
        registry.insert_tracking("artifacts-followed", |p| {
            ArtifactsFollowed::from_params(p).map(boxed_tracking)
        });
        registry.insert_tracking("artifacts-owned", |p| {
            ArtifactsOwned::from_params(p).map(boxed_tracking)
        });
        registry.insert_tracking("artifacts-group-owned", |p| {
            ArtifactsGroupOwned::from_params(p).map(boxed_tracking)
        });
        registry.insert_tracking("related-events", |p| {
            RelatedEvents::from_params(p).map(boxed_tracking)
        });
        registry.insert_tracking("users-followed", |p| {
            UsersFollowed::from_params(p).map(boxed_tracking)
        });
        registry.insert_tracking("group-members-followed", |p| {
            GroupMembersFollowed::from_params(p).map(boxed_tracking)
        });
        registry.insert_tracking("everything", |p| {
            Everything::from_params(p).map(boxed_tracking)
        });

        registry.insert_filter("applications", |p| {
            Applications::from_params(p).map(boxed_filter)
        });
        registry.insert_filter("severities", |p| Severities::from_params(p).map(boxed_filter));
        registry.insert_filter("topic", |p| Topic::from_params(p).map(boxed_filter));
        registry.insert_filter("my_actions", |p| MyActions::from_params(p).map(boxed_filter));
        registry.insert_filter("muted", |p| Muted::from_params(p).map(boxed_filter));

        registry
    }

    fn insert_tracking<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn TrackingPredicate>, String> + Send + Sync + 'static,
    {
        self.tracking.insert(name.to_string(), Arc::new(factory));
    }

    fn insert_filter<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Filter>, String> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(factory));
    }

    /// Register an additional tracking predicate.
    ///
    /// # Returns
    ///
    /// Error if a predicate with the same name already exists.
    pub fn register_tracking(
        &mut self,
        name: &str,
        factory: TrackingFactory,
    ) -> Result<(), ConfigError> {
        if self.tracking.contains_key(name) {
            return Err(ConfigError::ValidationError(format!(
                "tracking rule '{}' already registered",
                name
            )));
        }
        self.tracking.insert(name.to_string(), factory);
        Ok(())
    }

    /// Register an additional filter.
    ///
    /// # Returns
    ///
    /// Error if a filter with the same name already exists.
    pub fn register_filter(&mut self, name: &str, factory: FilterFactory) -> Result<(), ConfigError> {
        if self.filters.contains_key(name) {
            return Err(ConfigError::ValidationError(format!(
                "filter '{}' already registered",
                name
            )));
        }
        self.filters.insert(name.to_string(), factory);
        Ok(())
    }

    /// Instantiate the tracking predicate `name` for rule `rule`.
    pub fn build_tracking(
        &self,
        rule: &str,
        name: &str,
        params: &Value,
    ) -> Result<Box<dyn TrackingPredicate>, ConfigError> {
        let factory = self
            .tracking
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTrackingRule {
                rule: rule.to_string(),
                name: name.to_string(),
            })?;
        factory(params).map_err(|message| ConfigError::InvalidParams {
            rule: rule.to_string(),
            predicate: name.to_string(),
            message,
        })
    }

    /// Instantiate the filter `name` for rule `rule`.
    pub fn build_filter(
        &self,
        rule: &str,
        name: &str,
        params: &Value,
    ) -> Result<Box<dyn Filter>, ConfigError> {
        let factory = self
            .filters
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFilter {
                rule: rule.to_string(),
                name: name.to_string(),
            })?;
        factory(params).map_err(|message| ConfigError::InvalidParams {
            rule: rule.to_string(),
            predicate: name.to_string(),
            message,
        })
    }

    /// Registered tracking predicate names, sorted.
    pub fn tracking_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tracking.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Registered filter names, sorted.
    pub fn filter_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.filters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PredicateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("tracking", &self.tracking_names())
            .field("filters", &self.filter_names())
            .finish()
    }
}

fn boxed_tracking<P: TrackingPredicate + 'static>(p: P) -> Box<dyn TrackingPredicate> {
    Box::new(p)
}

fn boxed_filter<F: Filter + 'static>(f: F) -> Box<dyn Filter> {
    Box::new(f)
}

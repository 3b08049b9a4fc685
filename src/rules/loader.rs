//! Compiles stored rules into an immutable, evaluable rule set.

use std::fmt;
use std::sync::Arc;

use super::filters::Filter;
use super::model::{Destination, Rule, RuleId};
use super::registry::PredicateRegistry;
use super::repository::RuleRepository;
use super::tracking::TrackingPredicate;
use crate::error::{ConfigError, RepositoryError};

/// A rule with its predicate and filters instantiated.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: RuleId,
    pub owner: String,
    pub name: String,
    pub tracking: Box<dyn TrackingPredicate>,
    pub generation_rules: Vec<CompiledGenerationRule>,
}

#[derive(Debug)]
pub struct CompiledGenerationRule {
    pub destinations: Vec<Destination>,
    pub filters: Vec<Box<dyn Filter>>,
}

/// Immutable set of compiled rules, shared behind `Arc`.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    rejected: usize,
}

impl RuleSet {
    pub fn new(rules: Vec<CompiledRule>) -> Self {
        Self { rules, rejected: 0 }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Enabled rules left out because they failed to compile.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}

/// Loads enabled rules from a repository and compiles them.
#[derive(Clone)]
pub struct RuleSetLoader {
    repository: Arc<dyn RuleRepository>,
    registry: Arc<PredicateRegistry>,
}

impl RuleSetLoader {
    pub fn new(repository: Arc<dyn RuleRepository>, registry: Arc<PredicateRegistry>) -> Self {
        Self {
            repository,
            registry,
        }
    }

    pub fn repository(&self) -> &Arc<dyn RuleRepository> {
        &self.repository
    }

    /// Load and compile every enabled rule.
    ///
    /// Rules that fail to compile are logged, counted and left out; the rest
    /// load normally.
    ///
    /// # Errors
    /// Returns the repository error if the rules cannot be read.
    pub async fn load(&self) -> Result<RuleSet, RepositoryError> {
        let rules = self.repository.load_enabled_rules().await?;
        let mut compiled = Vec::with_capacity(rules.len());
        let mut rejected = 0;

        for rule in &rules {
            match self.compile(rule) {
                Ok(c) => compiled.push(c),
                Err(errors) => {
                    rejected += 1;
                    metrics::counter!("herald_rules_rejected_total").increment(1);
                    for error in &errors {
                        tracing::warn!(
                            rule_id = rule.id,
                            owner = %rule.owner,
                            error = %error,
                            "Rejecting invalid rule"
                        );
                    }
                }
            }
        }

        metrics::gauge!("herald_rules_loaded").set(compiled.len() as f64);
        tracing::debug!(loaded = compiled.len(), rejected, "Rule set compiled");

        Ok(RuleSet {
            rules: compiled,
            rejected,
        })
    }

    /// Compile one rule, collecting every error it carries.
    pub fn compile(&self, rule: &Rule) -> Result<CompiledRule, Vec<ConfigError>> {
        let label = rule.label();
        let mut errors = Vec::new();

        let tracking = self
            .registry
            .build_tracking(&label, &rule.tracking_rule.name, &rule.tracking_rule.params)
            .map_err(|e| errors.push(e))
            .ok();

        let mut generation_rules = Vec::with_capacity(rule.generation_rules.len());
        for generation in &rule.generation_rules {
            for destination in &generation.destinations {
                if destination.protocol.is_empty() || destination.address.is_empty() {
                    errors.push(ConfigError::ValidationError(format!(
                        "rule {}: destination '{}' needs a protocol and an address",
                        label, destination
                    )));
                }
            }

            let mut filters = Vec::with_capacity(generation.filters.len());
            for (name, params) in &generation.filters {
                match self.registry.build_filter(&label, name, params) {
                    Ok(f) => filters.push(f),
                    Err(e) => errors.push(e),
                }
            }

            generation_rules.push(CompiledGenerationRule {
                destinations: generation.destinations.clone(),
                filters,
            });
        }

        match tracking {
            Some(tracking) if errors.is_empty() => Ok(CompiledRule {
                id: rule.id,
                owner: rule.owner.clone(),
                name: rule.name.clone(),
                tracking,
                generation_rules,
            }),
            _ => Err(errors),
        }
    }

    /// Every error found in `rules`, enabled or not.
    pub fn validate(&self, rules: &[Rule]) -> Vec<ConfigError> {
        rules
            .iter()
            .filter_map(|rule| self.compile(rule).err())
            .flatten()
            .collect()
    }
}

impl fmt::Debug for RuleSetLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSetLoader")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

//! Notification rules: storage, vocabulary and compilation.
//!
//! A [`Rule`] names one tracking predicate and an ordered list of generation
//! rules. The [`RuleSetLoader`] reads enabled rules from a [`RuleRepository`]
//! and compiles them through the [`PredicateRegistry`] into a [`RuleSet`].

pub mod filters;
mod loader;
mod model;
mod registry;
mod repository;
pub mod tracking;

pub use filters::{Filter, FilterContext};
pub use loader::{CompiledGenerationRule, CompiledRule, RuleSet, RuleSetLoader};
pub use model::{Destination, GenerationRule, Rule, RuleId, TrackingRule};
pub use registry::{FilterFactory, PredicateRegistry, TrackingFactory};
pub use repository::{MemoryRuleRepository, RuleRepository, YamlRuleRepository, parse_rules};
pub use tracking::{MatchContext, MatchResult, TrackingPredicate};

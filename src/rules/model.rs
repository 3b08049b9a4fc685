//! The rule aggregate as stored by the rule repository.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a stored rule.
pub type RuleId = i64;

/// A user's notification rule: one tracking rule, ordered generation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub id: RuleId,
    /// Username of the rule owner.
    pub owner: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub tracking_rule: TrackingRule,
    #[serde(default)]
    pub generation_rules: Vec<GenerationRule>,
}

/// Selects a tracking predicate by name and carries its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingRule {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// Destinations reached when every filter passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationRule {
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Filter name to filter params.
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
}

/// Where a notification goes, e.g. `("email", "user@example.com")`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Destination {
    pub protocol: String,
    pub address: String,
}

impl Destination {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.address)
    }
}

impl Rule {
    /// Label used in logs and errors: the id, plus the name when set.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            format!("{} ({})", self.id, self.name)
        }
    }
}

fn default_true() -> bool {
    true
}

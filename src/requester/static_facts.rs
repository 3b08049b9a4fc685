//! Fact backend serving facts declared in configuration.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use super::{Fact, FactBackend, InvalidationPolicy, LookupKind};
use crate::error::{ConfigError, LookupError};
use crate::message::{Artifact, Message};

/// Backend answering from a fixed map. Unknown keys resolve to an empty fact.
#[derive(Debug, Clone)]
pub struct StaticFactBackend {
    kind: LookupKind,
    facts: HashMap<String, Fact>,
    policy: InvalidationPolicy,
}

impl StaticFactBackend {
    pub fn new(kind: LookupKind, facts: HashMap<String, Fact>) -> Self {
        Self {
            kind,
            facts,
            policy: InvalidationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build from configuration entries.
    ///
    /// Group members are plain names; artifacts use the `kind/name`
    /// shorthand, e.g. `packages/firefox`.
    pub fn from_entries(
        kind: LookupKind,
        entries: &HashMap<String, Vec<String>>,
    ) -> Result<Self, ConfigError> {
        let mut facts = HashMap::with_capacity(entries.len());

        for (key, values) in entries {
            let fact = match kind {
                LookupKind::GroupMembers => Fact::Names(values.iter().cloned().collect()),
                LookupKind::UserArtifacts | LookupKind::GroupArtifacts => {
                    let mut artifacts = BTreeSet::new();
                    for value in values {
                        let artifact =
                            Artifact::parse(value).ok_or_else(|| ConfigError::InvalidService {
                                kind: kind.to_string(),
                                message: format!(
                                    "facts.{}: '{}' is not a kind/name artifact",
                                    key, value
                                ),
                            })?;
                        artifacts.insert(artifact);
                    }
                    Fact::Artifacts(artifacts)
                }
            };
            facts.insert(key.clone(), fact);
        }

        Ok(Self::new(kind, facts))
    }
}

#[async_trait]
impl FactBackend for StaticFactBackend {
    fn kind(&self) -> LookupKind {
        self.kind
    }

    async fn fetch(&self, key: &str) -> Result<Fact, LookupError> {
        Ok(self
            .facts
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.kind.empty_fact()))
    }

    fn invalidation_signal(&self, message: &Message) -> Vec<String> {
        self.policy.keys(self.kind, message)
    }
}

//! Read path to the stored rules.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;

use super::model::Rule;
use crate::error::RepositoryError;

/// Point-in-time, read-only access to the rules.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Every enabled rule with its tracking rule, generation rules,
    /// destinations and filters.
    async fn load_enabled_rules(&self) -> Result<Vec<Rule>, RepositoryError>;

    /// Discard the in-flight session after a failed load.
    async fn rollback(&self) {}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Rules stored in a YAML file under a top-level `rules:` key.
///
/// The file is re-read on every load so that edits are picked up the next
/// time the rule set is rebuilt.
#[derive(Debug, Clone)]
pub struct YamlRuleRepository {
    path: PathBuf,
}

impl YamlRuleRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every rule in the file, enabled or not.
    pub async fn load_all(&self) -> Result<Vec<Rule>, RepositoryError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RepositoryError::Load(format!("{}: {}", self.path.display(), e)))?;
        parse_rules(&content)
    }
}

#[async_trait]
impl RuleRepository for YamlRuleRepository {
    async fn load_enabled_rules(&self) -> Result<Vec<Rule>, RepositoryError> {
        let mut rules = self.load_all().await?;
        rules.retain(|r| r.enabled);
        Ok(rules)
    }
}

/// Parse a rules document and check rule ids are unique.
pub fn parse_rules(content: &str) -> Result<Vec<Rule>, RepositoryError> {
    let file: RulesFile =
        serde_yaml::from_str(content).map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let mut seen = HashSet::with_capacity(file.rules.len());
    for rule in &file.rules {
        if !seen.insert(rule.id) {
            return Err(RepositoryError::Decode(format!(
                "duplicate rule id {}",
                rule.id
            )));
        }
    }

    Ok(file.rules)
}

/// In-process repository whose contents can be swapped at runtime.
#[derive(Debug, Default)]
pub struct MemoryRuleRepository {
    rules: RwLock<Vec<Rule>>,
}

impl MemoryRuleRepository {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Replace the stored rules.
    pub fn replace(&self, rules: Vec<Rule>) -> Result<(), RepositoryError> {
        let mut guard = self
            .rules
            .write()
            .map_err(|_| RepositoryError::Unavailable("rule store lock poisoned".to_string()))?;
        *guard = rules;
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn load_enabled_rules(&self) -> Result<Vec<Rule>, RepositoryError> {
        let guard = self
            .rules
            .read()
            .map_err(|_| RepositoryError::Unavailable("rule store lock poisoned".to_string()))?;
        Ok(guard.iter().filter(|r| r.enabled).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RULES: &str = r#"
rules:
  - id: 1
    owner: alice
    tracking_rule:
      name: packages
      params: {packages: [firefox]}
  - id: 2
    owner: bob
    enabled: false
    tracking_rule:
      name: everything
"#;

    #[tokio::test]
    async fn yaml_repository_loads_enabled_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RULES.as_bytes()).unwrap();

        let repo = YamlRuleRepository::new(file.path());
        let all = repo.load_all().await.unwrap();
        assert_eq!(all.len(), 2);

        let enabled = repo.load_enabled_rules().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].owner, "alice");
    }

    #[tokio::test]
    async fn yaml_repository_sees_edits() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"rules: []\n").unwrap();
        let repo = YamlRuleRepository::new(file.path());
        assert!(repo.load_enabled_rules().await.unwrap().is_empty());

        std::fs::write(file.path(), RULES).unwrap();
        assert_eq!(repo.load_enabled_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_load_error() {
        let repo = YamlRuleRepository::new("/nonexistent/rules.yaml");
        match repo.load_enabled_rules().await {
            Err(RepositoryError::Load(msg)) => assert!(msg.contains("/nonexistent/rules.yaml")),
            other => panic!("Expected Load error, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let content = r#"
rules:
  - {id: 1, owner: a, tracking_rule: {name: everything}}
  - {id: 1, owner: b, tracking_rule: {name: everything}}
"#;
        match parse_rules(content) {
            Err(RepositoryError::Decode(msg)) => assert!(msg.contains("duplicate rule id 1")),
            other => panic!("Expected Decode error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_yaml_is_decode_error() {
        assert!(matches!(
            parse_rules("rules: [{id: one}]"),
            Err(RepositoryError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn memory_repository_replace() {
        let repo = MemoryRuleRepository::default();
        assert!(repo.load_enabled_rules().await.unwrap().is_empty());

        repo.replace(parse_rules(RULES).unwrap()).unwrap();
        let rules = repo.load_enabled_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, 1);
    }
}

//! Runtime configuration with pre-compiled topic patterns and templates.

use super::services::{ServicesConfig, SinksConfig};
use super::types::{Config, DefaultsConfig, DispatchConfig, MetricsConfig};
use crate::error::ConfigError;
use crate::requester::RequesterSettings;
use crate::topic::TopicPattern;
use crate::tracked::TrackedSettings;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Runtime configuration, ready to wire the engine.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Absolute or config-relative path of the rules file, resolved.
    pub rules_path: PathBuf,
    pub tracked: TrackedSettings,
    pub requester: RequesterSettings,
    pub services: ServicesConfig,
    pub dispatch: DispatchConfig,
    pub defaults: DefaultsConfig,
    pub templates: HashMap<String, CompiledTemplate>,
    pub sinks: SinksConfig,
    pub metrics: MetricsConfig,
    pub config_dir: PathBuf,
}

/// Pre-validated notification template.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub title: String,
    pub body: String,
}

impl RuntimeConfig {
    /// Template used for a protocol: the sink's override, else the default.
    pub fn template_for(&self, protocol: &str) -> &str {
        self.sinks
            .get(protocol)
            .and_then(|sink| sink.template())
            .unwrap_or(&self.defaults.template)
    }

    /// Template name per configured protocol.
    pub fn protocol_templates(&self) -> HashMap<String, String> {
        self.sinks
            .keys()
            .map(|protocol| (protocol.clone(), self.template_for(protocol).to_string()))
            .collect()
    }
}

impl Config {
    /// Compile configuration into runtime-ready format.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidTopicPattern`] if a rule-change topic
    /// does not compile. `validate()` reports the same error up front.
    pub fn compile(self, config_path: &Path) -> Result<RuntimeConfig, ConfigError> {
        let config_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();

        let rules_path = if self.rules.path.is_absolute() {
            self.rules.path
        } else {
            config_dir.join(&self.rules.path)
        };

        let tracked = TrackedSettings {
            rule_change_topics: TopicPattern::compile_all(&self.tracked.rule_change_topics)?,
            max_age: self.tracked.max_age,
        };

        let requester = RequesterSettings {
            ttl: self.requester.ttl,
            max_capacity: self.requester.max_capacity,
            timeout: self.requester.timeout,
        };

        let templates = self
            .templates
            .into_iter()
            .map(|(name, template)| {
                (
                    name,
                    CompiledTemplate {
                        title: template.title,
                        body: template.body,
                    },
                )
            })
            .collect();

        Ok(RuntimeConfig {
            rules_path,
            tracked,
            requester,
            services: self.services,
            dispatch: self.dispatch,
            defaults: self.defaults,
            templates,
            sinks: self.sinks,
            metrics: self.metrics,
            config_dir,
        })
    }
}

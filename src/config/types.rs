//! Core configuration types and loading.

use super::services::{ServiceConfig, ServicesConfig, SinkConfig, SinksConfig, default_true};
use super::validation::validate_template_parts;
use crate::error::ConfigError;
use crate::requester::{
    DEFAULT_FACT_TTL, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_MAX_CAPACITY, StaticFactBackend,
};
use crate::topic::TopicPattern;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/herald/config.yaml";

/// Main configuration structure for herald.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Where the notification rules live.
    pub rules: RulesConfig,
    /// Tracked-criteria snapshot settings.
    #[serde(default)]
    pub tracked: TrackedConfig,
    /// Fact cache settings.
    #[serde(default)]
    pub requester: RequesterConfig,
    /// Fact services keyed by lookup kind.
    #[serde(default)]
    pub services: ServicesConfig,
    /// Evaluation and outbound queue settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub defaults: DefaultsConfig,
    /// Reusable notification templates.
    pub templates: HashMap<String, TemplateConfig>,
    /// Delivery sinks keyed by destination protocol.
    #[serde(default)]
    pub sinks: SinksConfig,
    /// Metrics exposition configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Rule storage location.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// YAML rules file; relative paths resolve against the config directory.
    pub path: PathBuf,
}

/// Tracked-criteria snapshot configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackedConfig {
    /// Topic globs of messages announcing a rule change.
    #[serde(default)]
    pub rule_change_topics: Vec<String>,
    /// Rebuild a snapshot older than this even without a change message.
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

/// Fact cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequesterConfig {
    #[serde(default = "default_fact_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    #[serde(default = "default_lookup_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_fact_ttl() -> Duration {
    DEFAULT_FACT_TTL
}

fn default_max_capacity() -> u64 {
    DEFAULT_MAX_CAPACITY
}

fn default_lookup_timeout() -> Duration {
    DEFAULT_LOOKUP_TIMEOUT
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_FACT_TTL,
            max_capacity: DEFAULT_MAX_CAPACITY,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// Dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Rules evaluated concurrently for one message.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Capacity of the outbound notification queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_concurrency() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics exposition is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Port to expose metrics on (default: 9090).
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

/// Default configuration values.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    /// Template used when a protocol has no override.
    pub template: String,
    /// Timezone for formatted timestamps (e.g., "UTC", "Europe/Paris").
    #[serde(default = "default_timestamp_timezone")]
    pub timestamp_timezone: String,
}

fn default_timestamp_timezone() -> String {
    "UTC".to_string()
}

/// Template configuration for notification content.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub title: String,
    pub body: String,
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// # Errors
    /// Returns [`ConfigError::LoadError`] if the file cannot be read.
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate the whole configuration, collecting every error.
    ///
    /// Rules themselves are validated separately by the rule set loader
    /// since they live in their own file.
    ///
    /// # Errors
    /// Returns a `Vec<ConfigError>` containing all validation errors found.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        // Templates
        if !self.templates.contains_key(&self.defaults.template) {
            errors.push(ConfigError::InvalidTemplate {
                name: self.defaults.template.clone(),
                message: "defaults.template not found in templates".to_string(),
            });
        }
        for (name, template) in &self.templates {
            errors.extend(validate_template_parts(
                name,
                &[("title", &template.title), ("body", &template.body)],
            ));
        }

        // Topic patterns
        for pattern in &self.tracked.rule_change_topics {
            if let Err(e) = TopicPattern::new(pattern) {
                errors.push(e);
            }
        }

        // Fact services
        for (kind, service) in &self.services {
            for pattern in service.invalidate_topics() {
                if let Err(e) = TopicPattern::new(pattern) {
                    errors.push(e);
                }
            }
            match service {
                ServiceConfig::Http(cfg) if !cfg.url.contains("{key}") => {
                    errors.push(ConfigError::InvalidService {
                        kind: kind.to_string(),
                        message: "url must contain the {key} placeholder".to_string(),
                    });
                }
                ServiceConfig::Static(cfg) => {
                    if let Err(e) = StaticFactBackend::from_entries(*kind, &cfg.facts) {
                        errors.push(e);
                    }
                }
                ServiceConfig::Http(_) => {}
            }
        }

        // Sinks
        for (protocol, sink) in &self.sinks {
            if let Some(template) = sink.template()
                && !self.templates.contains_key(template)
            {
                errors.push(ConfigError::InvalidSink {
                    protocol: protocol.clone(),
                    message: format!("template '{}' not found in templates", template),
                });
            }
            if let SinkConfig::Webhook(cfg) = sink
                && let Some(body_template) = &cfg.body_template
            {
                for e in validate_template_parts(protocol, &[("body_template", body_template)]) {
                    errors.push(ConfigError::InvalidSink {
                        protocol: protocol.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        // Bounds
        if self.dispatch.concurrency == 0 {
            errors.push(ConfigError::ValidationError(
                "dispatch.concurrency must be at least 1".to_string(),
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            errors.push(ConfigError::ValidationError(
                "dispatch.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.requester.timeout.is_zero() {
            errors.push(ConfigError::ValidationError(
                "requester.timeout must be greater than zero".to_string(),
            ));
        }

        if self
            .defaults
            .timestamp_timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            errors.push(ConfigError::ValidationError(format!(
                "defaults.timestamp_timezone '{}' is not a valid timezone",
                self.defaults.timestamp_timezone
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

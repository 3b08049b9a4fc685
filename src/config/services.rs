//! Fact service and delivery sink configurations.

use serde::Deserialize;
use std::collections::HashMap;

use crate::requester::LookupKind;

/// Fact services keyed by the lookup kind they serve.
pub type ServicesConfig = HashMap<LookupKind, ServiceConfig>;

/// Delivery sinks keyed by destination protocol (e.g. `email`, `irc`).
pub type SinksConfig = HashMap<String, SinkConfig>;

/// Fact service configuration with type tag for deserialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceConfig {
    #[serde(rename = "http")]
    Http(HttpServiceConfig),
    #[serde(rename = "static")]
    Static(StaticServiceConfig),
}

impl ServiceConfig {
    pub fn invalidate_topics(&self) -> &[String] {
        match self {
            ServiceConfig::Http(cfg) => &cfg.invalidate_topics,
            ServiceConfig::Static(cfg) => &cfg.invalidate_topics,
        }
    }
}

/// A JSON directory service queried over HTTP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpServiceConfig {
    /// URL template containing `{key}` (supports `${ENV_VAR}` substitution).
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Topic globs of messages that make the keys they name stale.
    #[serde(default)]
    pub invalidate_topics: Vec<String>,
}

/// Facts declared inline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticServiceConfig {
    /// Key to names (group members) or `kind/name` artifacts.
    #[serde(default)]
    pub facts: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub invalidate_topics: Vec<String>,
}

/// Sink configuration with type tag for deserialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SinkConfig {
    #[serde(rename = "webhook")]
    Webhook(WebhookSinkConfig),
    #[serde(rename = "stdout")]
    Stdout(StdoutSinkConfig),
}

impl SinkConfig {
    /// Template used to render content for this protocol, if overridden.
    pub fn template(&self) -> Option<&str> {
        match self {
            SinkConfig::Webhook(cfg) => cfg.template.as_deref(),
            SinkConfig::Stdout(cfg) => cfg.template.as_deref(),
        }
    }
}

/// Configuration for a webhook sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookSinkConfig {
    /// Target URL (supports `${ENV_VAR}` substitution).
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

/// Configuration for the stdout sink.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StdoutSinkConfig {
    #[serde(default)]
    pub template: Option<String>,
}

fn default_post() -> String {
    "POST".to_string()
}

pub(crate) fn default_true() -> bool {
    true
}

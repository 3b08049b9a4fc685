//! Configuration loading and validation for herald.
//!
//! This module handles loading the YAML configuration file,
//! validation, and environment variable substitution for secrets.

mod env;
mod runtime;
mod secret;
mod services;
mod types;
mod validation;

pub use env::resolve_env_vars;
pub use runtime::{CompiledTemplate, RuntimeConfig};
pub use secret::SecretString;
pub use services::{
    HttpServiceConfig, ServiceConfig, ServicesConfig, SinkConfig, SinksConfig,
    StaticServiceConfig, StdoutSinkConfig, WebhookSinkConfig,
};
pub use types::{
    Config, DEFAULT_CONFIG_PATH, DefaultsConfig, DispatchConfig, MetricsConfig, RequesterConfig,
    RulesConfig, TemplateConfig, TrackedConfig,
};
pub use validation::validate_template_render;

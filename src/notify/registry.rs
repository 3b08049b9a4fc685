//! Sink registry keyed by destination protocol.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{SinkConfig, SinksConfig};
use crate::error::ConfigError;

use super::{NotificationSink, StdoutSink, WebhookSink};

/// Routes each destination protocol to the sink that delivers it.
#[derive(Debug, Default)]
pub struct SinkRegistry {
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
        }
    }

    /// Register a sink under its protocol.
    ///
    /// # Errors
    /// [`ConfigError::ValidationError`] if the protocol already has a sink.
    pub fn register(&mut self, sink: Arc<dyn NotificationSink>) -> Result<(), ConfigError> {
        let protocol = sink.protocol().to_string();
        if self.sinks.contains_key(&protocol) {
            return Err(ConfigError::ValidationError(format!(
                "sink for protocol '{}' already registered",
                protocol
            )));
        }
        self.sinks.insert(protocol, sink);
        Ok(())
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn NotificationSink>> {
        self.sinks.get(protocol).cloned()
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Build every configured sink, collecting all errors.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let registry = SinkRegistry::from_config(&runtime.sinks, http_client)?;
    /// ```
    pub fn from_config(
        sinks_config: &SinksConfig,
        http_client: reqwest::Client,
    ) -> Result<Self, Vec<ConfigError>> {
        let mut registry = SinkRegistry::new();
        let mut errors = Vec::new();

        for (protocol, config) in sinks_config {
            match Self::create_sink(protocol, config, &http_client) {
                Ok(sink) => {
                    if let Err(e) = registry.register(sink) {
                        errors.push(e);
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(registry)
        } else {
            Err(errors)
        }
    }

    fn create_sink(
        protocol: &str,
        config: &SinkConfig,
        http_client: &reqwest::Client,
    ) -> Result<Arc<dyn NotificationSink>, ConfigError> {
        match config {
            SinkConfig::Webhook(wh_config) => {
                let sink = WebhookSink::from_config(protocol, wh_config, http_client.clone())?;

                tracing::info!(
                    protocol = %protocol,
                    sink_type = "webhook",
                    method = %wh_config.method,
                    "Registered webhook sink from config"
                );

                Ok(Arc::new(sink))
            }
            SinkConfig::Stdout(_) => {
                tracing::info!(
                    protocol = %protocol,
                    sink_type = "stdout",
                    "Registered stdout sink from config"
                );

                Ok(Arc::new(StdoutSink::new(protocol)))
            }
        }
    }
}

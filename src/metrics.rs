//! Prometheus metrics exposition server.
//!
//! This module provides an HTTP server that exposes herald metrics
//! in Prometheus format on a configurable port.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Set once the global recorder is installed.
static RECORDER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Register all metric descriptions for Prometheus.
///
/// Call once at startup after the recorder is installed. Descriptions
/// provide HELP text in the Prometheus output.
pub fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Messages
    describe_counter!(
        "herald_messages_received_total",
        "Total number of messages handed to the dispatcher"
    );
    describe_counter!(
        "herald_messages_dropped_total",
        "Total number of messages rejected by the tracked-criteria pre-filter"
    );
    describe_counter!(
        "herald_messages_deprecated_total",
        "Total number of deprecated candidate messages skipped"
    );
    describe_counter!(
        "herald_messages_invalid_total",
        "Total number of inbound lines that did not decode into a message"
    );
    describe_counter!(
        "herald_dispatch_errors_total",
        "Total number of messages whose dispatch failed on a repository error"
    );

    // Rules
    describe_counter!(
        "herald_rules_matched_total",
        "Total number of rule matches across all messages"
    );
    describe_counter!(
        "herald_rules_suppressed_total",
        "Total number of rule matches on deprecated messages, which generate nothing"
    );
    describe_counter!(
        "herald_rules_rejected_total",
        "Total number of enabled rules left out of a rule set because they are invalid"
    );
    describe_counter!(
        "herald_rule_errors_total",
        "Total number of rules skipped because a predicate or filter failed"
    );
    describe_counter!(
        "herald_rule_lookup_failures_total",
        "Total number of rules treated as non-matching after a failed lookup, by kind"
    );
    describe_gauge!(
        "herald_rules_loaded",
        "Number of rules in the current rule set"
    );

    // Tracked criteria
    describe_counter!(
        "herald_tracked_invalidations_total",
        "Total number of tracked-criteria invalidations"
    );
    describe_counter!(
        "herald_tracked_rebuilds_total",
        "Total number of tracked-criteria snapshot rebuilds"
    );
    describe_counter!(
        "herald_tracked_prime_failures_total",
        "Total number of rebuilds that fell back to matching everything"
    );
    describe_histogram!(
        "herald_tracked_rebuild_seconds",
        "Time to load rules and prime tracked criteria"
    );

    // Requester
    describe_counter!(
        "herald_requester_fetches_total",
        "Total number of fact fetches sent to backends, by kind"
    );
    describe_counter!(
        "herald_lookup_failures_total",
        "Total number of failed or timed out fact lookups, by kind"
    );
    describe_counter!(
        "herald_requester_invalidations_total",
        "Total number of cached facts evicted by messages, by kind"
    );

    // Notifications
    describe_counter!(
        "herald_notifications_generated_total",
        "Total number of notifications produced by rule evaluation"
    );
    describe_counter!(
        "herald_notifications_deduplicated_total",
        "Total number of duplicate notifications suppressed before enqueue"
    );
    describe_counter!(
        "herald_enqueue_failures_total",
        "Total number of notifications the outbound queue refused"
    );
    describe_counter!(
        "herald_notifications_sent_total",
        "Total number of notifications delivered by sinks"
    );
    describe_counter!(
        "herald_notifications_failed_total",
        "Total number of notifications that permanently failed delivery"
    );
    describe_counter!(
        "herald_notify_errors_total",
        "Total number of delivery errors, including unknown protocols"
    );
    describe_counter!(
        "herald_template_errors_total",
        "Total number of template render failures replaced by a fallback"
    );
    describe_gauge!(
        "herald_queue_size",
        "Current number of notifications in the outbound queue"
    );

    describe_gauge!(
        "herald_build_info",
        "Build information with version label (always 1)"
    );
}

/// Metrics server for Prometheus exposition.
///
/// Serves metrics on `/metrics`.
pub struct MetricsServer {
    port: u16,
    /// Signalled once the recorder is installed, so callers can avoid
    /// emitting metrics that would be lost.
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsServer {
    /// Create a new metrics server bound to the given port.
    ///
    /// Use port 0 to let the OS assign an available port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ready_tx: None,
        }
    }

    pub fn with_ready_signal(port: u16, ready_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            port,
            ready_tx: Some(ready_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install the global recorder and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be installed (including a
    /// second install in the same process).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

        let _ = RECORDER_INSTALLED.set(());
        register_metric_descriptions();

        if let Some(tx) = self.ready_tx {
            let _ = tx.send(());
        }

        info!(port = self.port, "Metrics server started on /metrics");
        cancel.cancelled().await;
        info!("Metrics server shutting down");

        Ok(())
    }
}

pub fn is_recorder_installed() -> bool {
    RECORDER_INSTALLED.get().is_some()
}

/// Initialize known metrics so they appear in `/metrics` from startup.
///
/// `protocols` are the configured sink protocols.
pub fn initialize_metrics(protocols: &[&str]) {
    use metrics::{counter, gauge};

    gauge!("herald_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    gauge!("herald_queue_size").set(0.0);

    counter!("herald_messages_received_total").absolute(0);
    counter!("herald_messages_dropped_total").absolute(0);
    counter!("herald_dispatch_errors_total").absolute(0);
    counter!("herald_enqueue_failures_total").absolute(0);

    for protocol in protocols {
        counter!("herald_notifications_sent_total", "protocol" => protocol.to_string())
            .absolute(0);
        counter!("herald_notifications_failed_total", "protocol" => protocol.to_string())
            .absolute(0);
    }

    tracing::info!(
        protocol_count = protocols.len(),
        "Metrics initialized to zero"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::time::Duration;

    static TEST_PORT: OnceLock<u16> = OnceLock::new();

    fn get_test_port() -> u16 {
        *TEST_PORT.get_or_init(|| {
            let port = portpicker::pick_unused_port().expect("No free port");

            let cancel = CancellationToken::new();
            let server = MetricsServer::new(port);

            std::thread::spawn(move || {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let _ = server.run(cancel).await;
                });
            });

            std::thread::sleep(Duration::from_millis(500));

            port
        })
    }

    async fn scrape(port: u16) -> String {
        reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/metrics", port))
            .send()
            .await
            .expect("Request should succeed")
            .text()
            .await
            .expect("Should have body")
    }

    #[tokio::test]
    async fn metrics_server_starts_and_responds() {
        let port = get_test_port();

        let resp = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/metrics", port))
            .send()
            .await
            .expect("Request should succeed");

        assert!(resp.status().is_success());
        assert!(is_recorder_installed());
    }

    #[tokio::test]
    async fn metrics_format_is_valid_prometheus() {
        let port = get_test_port();
        metrics::counter!("herald_messages_received_total").increment(1);

        for line in scrape(port).await.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let first_char = line.chars().next().unwrap_or(' ');
            assert!(
                first_char == '#' || first_char.is_alphabetic() || first_char == '_',
                "Invalid Prometheus line: {}",
                line
            );
        }
    }

    #[tokio::test]
    async fn metrics_incremented_appear_in_output() {
        let port = get_test_port();

        metrics::counter!("herald_notifications_sent_total", "protocol" => "email").increment(42);
        metrics::gauge!("herald_queue_size").set(5.0);

        let body = scrape(port).await;
        assert!(
            body.contains("herald_notifications_sent_total"),
            "Should contain notifications_sent metric. Body: {}",
            body
        );
        assert!(body.contains("protocol=\"email\""), "Body: {}", body);
    }

    #[test]
    fn new_creates_server_with_port() {
        assert_eq!(MetricsServer::new(9090).port(), 9090);
    }
}

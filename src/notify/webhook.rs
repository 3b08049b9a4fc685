//! Generic webhook sink.
//!
//! Delivers notifications to an HTTP endpoint with customizable body
//! templates and headers.

use crate::config::{SecretString, WebhookSinkConfig, resolve_env_vars};
use crate::error::{ConfigError, NotifyError};
use crate::notify::{Notification, NotificationSink, backoff_delay};
use async_trait::async_trait;
use chrono::Utc;
use minijinja::{Environment, context};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::Instrument;

/// Backoff base delay for webhook retries.
const WEBHOOK_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Maximum backoff delay for webhook retries.
const WEBHOOK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Maximum number of attempts per notification.
const WEBHOOK_MAX_RETRIES: u32 = 3;

/// JSON body sent when no `body_template` is configured.
#[derive(Debug, Clone, Serialize)]
pub struct DefaultWebhookPayload {
    pub protocol: String,
    pub address: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub owner: String,
    pub message_id: String,
    pub topic: String,
    pub title: String,
    pub body: String,
    /// RFC 3339 time the notification was sent.
    pub timestamp: String,
}

impl DefaultWebhookPayload {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            protocol: notification.protocol.clone(),
            address: notification.address.clone(),
            rule_id: notification.rule_id,
            rule_name: notification.rule_name.clone(),
            owner: notification.owner.clone(),
            message_id: notification.message_id.clone(),
            topic: notification.topic.clone(),
            title: notification.content.title.clone(),
            body: notification.content.body.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Webhook sink for one destination protocol.
///
/// # Retry Policy
///
/// - **5xx errors**: Retry (server temporarily unavailable)
/// - **Network errors**: Retry (timeout, connection refused)
/// - **4xx errors**: Do NOT retry (client error, invalid request)
pub struct WebhookSink {
    protocol: String,
    client: reqwest::Client,
    url: SecretString,
    method: Method,
    /// Resolved headers; may carry secrets.
    headers: HeaderMap,
    body_template_source: Option<String>,
}

fn validate_body_template(source: &str) -> Result<(), String> {
    let mut env = Environment::new();
    env.add_template("_validate", source)
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Render a body template with notification context.
fn render_body_template(source: &str, notification: &Notification) -> Result<String, NotifyError> {
    let env = Environment::new();
    env.render_str(
        source,
        context! {
            title => &notification.content.title,
            body => &notification.content.body,
            rule_id => notification.rule_id,
            rule_name => &notification.rule_name,
            owner => &notification.owner,
            protocol => &notification.protocol,
            address => &notification.address,
            message_id => &notification.message_id,
            topic => &notification.topic,
        },
    )
    .map_err(|e| NotifyError::SendFailed(format!("template render error: {}", e)))
}

impl WebhookSink {
    /// Build a sink from configuration.
    ///
    /// # Errors
    /// [`ConfigError::InvalidSink`] if URL or header resolution fails, the
    /// method is not POST/PUT, or the body template does not compile.
    pub fn from_config(
        protocol: &str,
        config: &WebhookSinkConfig,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidSink {
            protocol: protocol.to_string(),
            message,
        };

        let resolved_url =
            resolve_env_vars(&config.url).map_err(|e| invalid(format!("url: {}", e)))?;

        let method_upper = config.method.to_uppercase();
        if method_upper != "POST" && method_upper != "PUT" {
            return Err(invalid(format!(
                "unsupported method '{}': only POST and PUT are supported",
                config.method
            )));
        }
        let method = Method::from_str(&method_upper)
            .map_err(|_| invalid(format!("invalid method: {}", config.method)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let resolved_value = resolve_env_vars(value)
                .map_err(|e| invalid(format!("header '{}': {}", key, e)))?;
            let header_name = HeaderName::from_str(key)
                .map_err(|_| invalid(format!("invalid header name: {}", key)))?;
            let header_value = HeaderValue::from_str(&resolved_value)
                .map_err(|_| invalid(format!("invalid header value for '{}'", key)))?;
            headers.insert(header_name, header_value);
        }
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));

        let body_template_source = match &config.body_template {
            Some(source) => {
                validate_body_template(source)
                    .map_err(|e| invalid(format!("body_template: {}", e)))?;
                Some(source.clone())
            }
            None => None,
        };

        Ok(Self {
            protocol: protocol.to_string(),
            client,
            url: SecretString::new(resolved_url),
            method,
            headers,
            body_template_source,
        })
    }

    #[cfg(test)]
    pub fn url(&self) -> &str {
        self.url.expose()
    }

    #[cfg(test)]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[cfg(test)]
    pub fn has_body_template(&self) -> bool {
        self.body_template_source.is_some()
    }

    fn record_failure(&self) {
        metrics::counter!(
            "herald_notify_errors_total",
            "protocol" => self.protocol.clone(),
            "sink_type" => "webhook"
        )
        .increment(1);
        metrics::counter!(
            "herald_notifications_failed_total",
            "protocol" => self.protocol.clone()
        )
        .increment(1);
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn sink_type(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let span = tracing::info_span!(
            "send_webhook",
            rule_id = notification.rule_id,
            protocol = %self.protocol
        );

        async {
            let body = match &self.body_template_source {
                Some(source) => render_body_template(source, notification)?,
                None => {
                    let payload = DefaultWebhookPayload::from_notification(notification);
                    serde_json::to_string(&payload).map_err(|e| {
                        NotifyError::SendFailed(format!("JSON serialization error: {}", e))
                    })?
                }
            };
            tracing::trace!(body_len = body.len(), "Request body built");

            for attempt in 0..WEBHOOK_MAX_RETRIES {
                match self
                    .client
                    .request(self.method.clone(), self.url.expose())
                    .headers(self.headers.clone())
                    .body(body.clone())
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!("Webhook notification sent successfully");
                        metrics::counter!(
                            "herald_notifications_sent_total",
                            "protocol" => self.protocol.clone(),
                            "sink_type" => "webhook"
                        )
                        .increment(1);
                        return Ok(());
                    }
                    Ok(response) if response.status().is_client_error() => {
                        let status = response.status();
                        tracing::error!(
                            status = %status,
                            "Webhook returned client error, not retrying"
                        );
                        self.record_failure();
                        return Err(NotifyError::SendFailed(format!("client error: {}", status)));
                    }
                    Ok(response) => {
                        tracing::warn!(
                            attempt = attempt,
                            status = %response.status(),
                            "Webhook returned server error, retrying"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            attempt = attempt,
                            error = %e,
                            "Failed to send webhook, retrying"
                        );
                    }
                }

                if attempt < WEBHOOK_MAX_RETRIES - 1 {
                    let delay = backoff_delay(attempt, WEBHOOK_BACKOFF_BASE, WEBHOOK_BACKOFF_MAX);
                    tracing::debug!(delay_ms = delay.as_millis(), "Waiting before retry");
                    tokio::time::sleep(delay).await;
                }
            }

            tracing::error!(
                max_retries = WEBHOOK_MAX_RETRIES,
                "Failed to send webhook notification after all retries"
            );
            self.record_failure();
            Err(NotifyError::MaxRetriesExceeded)
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for WebhookSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // URL and headers may carry credentials.
        f.debug_struct("WebhookSink")
            .field("protocol", &self.protocol)
            .field("method", &self.method.as_str())
            .field("has_body_template", &self.body_template_source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::RenderedMessage;
    use serial_test::serial;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_notification() -> Notification {
        Notification {
            rule_id: 12,
            rule_name: "My packages".to_string(),
            owner: "alice".to_string(),
            message_id: "2026-abc".to_string(),
            topic: "org.fedoraproject.prod.bodhi.update.comment".to_string(),
            protocol: "email".to_string(),
            address: "alice@example.org".to_string(),
            content: RenderedMessage {
                title: "New comment".to_string(),
                body: "bob commented".to_string(),
            },
        }
    }

    fn config(url: &str) -> WebhookSinkConfig {
        WebhookSinkConfig {
            url: url.to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body_template: None,
            template: None,
        }
    }

    // ===================================================================
    // Construction
    // ===================================================================

    #[test]
    #[serial]
    fn from_config_with_all_fields() {
        temp_env::with_var("TEST_WEBHOOK_TOKEN", Some("secret-token-123"), || {
            let config = WebhookSinkConfig {
                method: "put".to_string(),
                headers: HashMap::from([(
                    "Authorization".to_string(),
                    "Bearer ${TEST_WEBHOOK_TOKEN}".to_string(),
                )]),
                body_template: Some(r#"{"text": "{{ title }}"}"#.to_string()),
                ..config("https://relay.example.org/email")
            };

            let sink = WebhookSink::from_config("email", &config, reqwest::Client::new()).unwrap();

            assert_eq!(sink.protocol(), "email");
            assert_eq!(sink.sink_type(), "webhook");
            assert_eq!(sink.url(), "https://relay.example.org/email");
            assert_eq!(sink.method(), &Method::PUT);
            assert!(sink.has_body_template());
        });
    }

    #[test]
    #[serial]
    fn from_config_fails_on_undefined_url_env_var() {
        temp_env::with_var("UNDEFINED_RELAY_URL", None::<&str>, || {
            let result = WebhookSink::from_config(
                "irc",
                &config("${UNDEFINED_RELAY_URL}"),
                reqwest::Client::new(),
            );

            match result {
                Err(ConfigError::InvalidSink { protocol, message }) => {
                    assert_eq!(protocol, "irc");
                    assert!(message.contains("url"));
                    assert!(message.contains("UNDEFINED_RELAY_URL"));
                }
                other => panic!("Expected InvalidSink, got {:?}", other),
            }
        });
    }

    #[test]
    fn from_config_rejects_unsupported_methods() {
        let config = WebhookSinkConfig {
            method: "PATCH".to_string(),
            ..config("https://relay.example.org")
        };

        match WebhookSink::from_config("irc", &config, reqwest::Client::new()) {
            Err(ConfigError::InvalidSink { message, .. }) => {
                assert!(message.contains("unsupported method"));
                assert!(message.contains("POST and PUT"));
            }
            other => panic!("Expected InvalidSink, got {:?}", other),
        }
    }

    #[test]
    fn from_config_fails_on_invalid_body_template() {
        let config = WebhookSinkConfig {
            body_template: Some("{% if unclosed".to_string()),
            ..config("https://relay.example.org")
        };

        match WebhookSink::from_config("irc", &config, reqwest::Client::new()) {
            Err(ConfigError::InvalidSink { message, .. }) => {
                assert!(message.contains("body_template"));
            }
            other => panic!("Expected InvalidSink, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn debug_output_does_not_expose_secrets() {
        temp_env::with_var("TEST_AUTH_TOKEN", Some("Bearer super-secret-token"), || {
            let config = WebhookSinkConfig {
                headers: HashMap::from([(
                    "Authorization".to_string(),
                    "${TEST_AUTH_TOKEN}".to_string(),
                )]),
                ..config("https://secret.example.org/hook/abc123")
            };
            let sink = WebhookSink::from_config("email", &config, reqwest::Client::new()).unwrap();
            let debug = format!("{:?}", sink);

            assert!(!debug.contains("secret.example.org"));
            assert!(!debug.contains("super-secret-token"));
            assert!(debug.contains("email"));
        });
    }

    // ===================================================================
    // Payloads
    // ===================================================================

    #[test]
    fn default_payload_carries_notification_fields() {
        let payload = DefaultWebhookPayload::from_notification(&make_notification());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["protocol"], "email");
        assert_eq!(json["address"], "alice@example.org");
        assert_eq!(json["rule_id"], 12);
        assert_eq!(json["title"], "New comment");
        assert!(!payload.timestamp.is_empty());
    }

    #[test]
    fn body_template_renders_notification_fields() {
        let source = r#"{"to": "{{ address }}", "subject": "{{ title }}", "rule": {{ rule_id }}}"#;
        let rendered = render_body_template(source, &make_notification()).unwrap();
        assert_eq!(
            rendered,
            r#"{"to": "alice@example.org", "subject": "New comment", "rule": 12}"#
        );
    }

    // ===================================================================
    // Delivery
    // ===================================================================

    #[tokio::test]
    async fn send_posts_default_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/email"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(serde_json::json!({
                "address": "alice@example.org",
                "message_id": "2026-abc"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::from_config(
            "email",
            &config(&format!("{}/email", server.uri())),
            reqwest::Client::new(),
        )
        .unwrap();

        sink.send(&make_notification()).await.unwrap();
    }

    #[tokio::test]
    async fn send_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let sink =
            WebhookSink::from_config("email", &config(&server.uri()), reqwest::Client::new())
                .unwrap();

        let err = sink.send(&make_notification()).await.unwrap_err();
        assert!(err.to_string().contains("client error"));
    }

    #[tokio::test]
    async fn send_retries_server_errors_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(u64::from(WEBHOOK_MAX_RETRIES))
            .mount(&server)
            .await;

        let sink =
            WebhookSink::from_config("email", &config(&server.uri()), reqwest::Client::new())
                .unwrap();

        let err = sink.send(&make_notification()).await.unwrap_err();
        assert!(matches!(err, NotifyError::MaxRetriesExceeded));
    }
}

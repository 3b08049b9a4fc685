//! Notification content templating.
//!
//! Turns a matched message into a title and body using Jinja2-style
//! templates powered by minijinja. Templates see the message fields, the
//! rule that matched and the values the tracking predicate bound:
//!
//! ```text
//! {{ topic }} {{ app_name }} {{ severity }} {{ agent_name }} {{ summary }}
//! {{ url }} {{ timestamp }} {{ timestamp_formatted }} {{ packages }} ...
//! {{ rule.id }} {{ rule.name }} {{ rule.owner }} {{ matched.owner }} {{ body.* }}
//! ```
//!
//! # Example
//!
//! ```ignore
//! let engine = TemplateEngine::new(runtime_config.templates);
//! let ctx = notification_context(&message, &rule, &matched, "UTC");
//! let content = engine.render_with_fallback("default", &ctx, &rule.name);
//! ```

use crate::config::CompiledTemplate;
use crate::error::TemplateError;
use crate::message::Message;
use crate::notify::format_timestamp;
use crate::rules::{CompiledRule, MatchContext};
use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Rendered notification content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub title: String,
    pub body: String,
}

/// Template engine for rendering notification content.
///
/// One lenient environment is shared by every render: undefined variables
/// render as empty strings. `Environment` is `Send + Sync`, so the engine is
/// shared across evaluation tasks behind an `Arc`.
pub struct TemplateEngine {
    env: Environment<'static>,
    templates: HashMap<String, CompiledTemplate>,
}

impl TemplateEngine {
    /// Create an engine over templates validated at config load.
    pub fn new(templates: HashMap<String, CompiledTemplate>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);

        Self { env, templates }
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Render a template with the given context.
    ///
    /// # Errors
    /// [`TemplateError::NotFound`] for an unknown name,
    /// [`TemplateError::RenderFailed`] when minijinja fails.
    pub fn render(&self, template_name: &str, ctx: &Value) -> Result<RenderedMessage, TemplateError> {
        let template =
            self.templates
                .get(template_name)
                .ok_or_else(|| TemplateError::NotFound {
                    name: template_name.to_string(),
                })?;

        let title = self.render_string(&template.title, ctx)?;
        let body = self.render_string(&template.body, ctx)?;

        tracing::trace!(
            template = %template_name,
            title_len = title.len(),
            body_len = body.len(),
            "Template rendered"
        );
        Ok(RenderedMessage { title, body })
    }

    fn render_string(&self, source: &str, ctx: &Value) -> Result<String, TemplateError> {
        self.env
            .render_str(source, ctx)
            .map_err(|e| TemplateError::RenderFailed {
                message: e.to_string(),
            })
    }

    /// Render, or fall back to a minimal notification naming the rule.
    ///
    /// The fallback never includes message fields.
    pub fn render_with_fallback(
        &self,
        template_name: &str,
        ctx: &Value,
        rule_name: &str,
    ) -> RenderedMessage {
        match self.render(template_name, ctx) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(
                    rule_name = %rule_name,
                    template = %template_name,
                    error = %e,
                    "Template render failed, using fallback"
                );
                metrics::counter!("herald_template_errors_total").increment(1);

                RenderedMessage {
                    title: format!("[{}] Notification", rule_name),
                    body: format!("Template render failed: {}\n\nCheck logs for details.", e),
                }
            }
        }
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Template context for one matched message and rule.
pub fn notification_context(
    message: &Message,
    rule: &CompiledRule,
    matched: &MatchContext,
    timezone: &str,
) -> Value {
    json!({
        "id": message.id,
        "topic": message.topic,
        "app_name": message.app_name,
        "severity": message.severity,
        "agent_name": message.agent_name,
        "summary": message.summary,
        "url": message.url,
        "timestamp": message.timestamp.map(|t| t.to_rfc3339()),
        "timestamp_formatted": message.timestamp.map(|t| format_timestamp(&t, timezone)),
        "packages": message.packages,
        "containers": message.containers,
        "modules": message.modules,
        "flatpaks": message.flatpaks,
        "usernames": message.usernames,
        "groups": message.groups,
        "body": message.body,
        "rule": {
            "id": rule.id,
            "name": rule.name,
            "owner": rule.owner,
        },
        "matched": matched.bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Severity;
    use crate::rules::PredicateRegistry;
    use chrono::{TimeZone, Utc};

    fn make_template(title: &str, body: &str) -> CompiledTemplate {
        CompiledTemplate {
            title: title.to_string(),
            body: body.to_string(),
        }
    }

    fn engine(title: &str, body: &str) -> TemplateEngine {
        TemplateEngine::new(HashMap::from([("t".to_string(), make_template(title, body))]))
    }

    fn rule() -> CompiledRule {
        let registry = PredicateRegistry::default();
        CompiledRule {
            id: 42,
            owner: "alice".to_string(),
            name: "My packages".to_string(),
            tracking: registry
                .build_tracking("42", "everything", &Value::Null)
                .unwrap(),
            generation_rules: Vec::new(),
        }
    }

    fn message() -> Message {
        let mut msg = Message::new("m-1", "org.fedoraproject.prod.bodhi.update.comment");
        msg.app_name = Some("bodhi".to_string());
        msg.severity = Severity::Warning;
        msg.agent_name = Some("bob".to_string());
        msg.summary = Some("bob commented on firefox-130".to_string());
        msg.packages.insert("firefox".to_string());
        msg.timestamp = Some(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        msg.body = json!({"update": {"alias": "FEDORA-2026-1"}});
        msg
    }

    // ============================================================
    // Rendering
    // ============================================================

    #[test]
    fn render_simple_template_with_variables() {
        let engine = engine("{{ app_name }}: {{ topic }}", "{{ summary }}");
        let ctx = json!({"app_name": "koji", "topic": "prod.buildsys.build", "summary": "done"});

        let result = engine.render("t", &ctx).unwrap();
        assert_eq!(result.title, "koji: prod.buildsys.build");
        assert_eq!(result.body, "done");
    }

    #[test]
    fn render_template_with_missing_field_no_error() {
        let engine = engine("{{ agent_name }}", "Missing: {{ nonexistent }}");
        let result = engine.render("t", &json!({"agent_name": "bob"})).unwrap();
        assert_eq!(result.title, "bob");
        assert_eq!(result.body, "Missing: ");
    }

    #[test]
    fn render_nonexistent_template_returns_error() {
        let engine = TemplateEngine::new(HashMap::new());
        match engine.render("nonexistent", &json!({})) {
            Err(TemplateError::NotFound { name }) => assert_eq!(name, "nonexistent"),
            other => panic!("Expected NotFound error, got {:?}", other),
        }
    }

    #[test]
    fn render_with_invalid_filter_uses_fallback() {
        let engine = engine("{{ summary | nonexistent_filter }}", "body");
        let ctx = json!({"summary": "secret-token-123"});

        assert!(engine.render("t", &ctx).is_err());

        let fallback = engine.render_with_fallback("t", &ctx, "rule-7");
        assert_eq!(fallback.title, "[rule-7] Notification");
        assert!(fallback.body.contains("Template render failed"));
        assert!(!fallback.body.contains("secret-token-123"));
    }

    // ============================================================
    // Context
    // ============================================================

    #[test]
    fn context_exposes_message_rule_and_bindings() {
        let matched = MatchContext::default().bind("group", "packagers");
        let ctx = notification_context(&message(), &rule(), &matched, "Europe/Paris");

        let engine = engine(
            "[{{ app_name }}] {{ severity }} {{ rule.owner }}",
            "{{ summary }} ({{ body.update.alias }}) via {{ matched.group }} at {{ timestamp_formatted }}; {{ packages | join(',') }}",
        );
        let result = engine.render("t", &ctx).unwrap();

        assert_eq!(result.title, "[bodhi] warning alice");
        assert_eq!(
            result.body,
            "bob commented on firefox-130 (FEDORA-2026-1) via packagers at 15/01/2026 11:00:00 CET; firefox"
        );
        assert_eq!(ctx["rule"]["id"], 42);
        assert_eq!(ctx["timestamp"], "2026-01-15T10:00:00+00:00");
    }

    #[test]
    fn context_without_timestamp_has_nulls() {
        let msg = Message::new("m-2", "t");
        let ctx = notification_context(&msg, &rule(), &MatchContext::default(), "UTC");
        assert!(ctx["timestamp"].is_null());
        assert!(ctx["timestamp_formatted"].is_null());
        assert_eq!(ctx["severity"], "info");
    }
}

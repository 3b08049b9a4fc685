//! Rule evaluation: turns a candidate message into notifications.
//!
//! Every rule of the snapshot is evaluated concurrently (bounded by
//! `dispatch.concurrency`); results are collected in rule order so the
//! produced batch is deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;

use crate::config::RuntimeConfig;
use crate::error::EvalError;
use crate::message::Message;
use crate::notify::Notification;
use crate::requester::Requester;
use crate::rules::{CompiledRule, FilterContext, MatchContext, MatchResult, RuleSet};
use crate::template::{RenderedMessage, TemplateEngine, notification_context};

/// Default number of rules evaluated concurrently for one message.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Outcome of evaluating one rule against one message.
#[derive(Debug)]
enum RuleOutcome {
    NoMatch,
    /// Matched on a deprecated message; nothing generated.
    Suppressed,
    Matched(Vec<Notification>),
    LookupFailed,
    Failed,
}

/// Result of evaluating a whole rule set against one message.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Notifications in rule order, then generation rule order, then
    /// destination order. May contain duplicates.
    pub notifications: Vec<Notification>,
    /// Rules that matched and ran their generation rules.
    pub matched_rules: usize,
    /// Rules that matched a deprecated message and generated nothing.
    pub suppressed: usize,
    /// Rules treated as non-matching because a fact lookup failed.
    pub lookup_failures: usize,
    /// Rules skipped because a predicate or filter failed.
    pub rule_errors: usize,
}

/// Evaluates rule sets and renders notification content.
pub struct Pipeline {
    templates: Arc<TemplateEngine>,
    protocol_templates: HashMap<String, String>,
    default_template: String,
    timezone: String,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(templates: Arc<TemplateEngine>, default_template: impl Into<String>) -> Self {
        Self {
            templates,
            protocol_templates: HashMap::new(),
            default_template: default_template.into(),
            timezone: "UTC".to_string(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Template overrides keyed by destination protocol.
    pub fn with_protocol_templates(mut self, templates: HashMap<String, String>) -> Self {
        self.protocol_templates = templates;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let templates = Arc::new(TemplateEngine::new(config.templates.clone()));
        Self::new(templates, config.defaults.template.clone())
            .with_protocol_templates(config.protocol_templates())
            .with_timezone(config.defaults.timestamp_timezone.clone())
            .with_concurrency(config.dispatch.concurrency)
    }

    fn template_for(&self, protocol: &str) -> &str {
        self.protocol_templates
            .get(protocol)
            .map(String::as_str)
            .unwrap_or(&self.default_template)
    }

    /// Evaluate every rule of `rules` against `message`.
    ///
    /// A failing rule never prevents other rules from being evaluated.
    pub async fn evaluate(
        &self,
        message: &Message,
        rules: &RuleSet,
        requester: &Requester,
    ) -> Evaluation {
        let outcomes: Vec<RuleOutcome> = stream::iter(rules.rules())
            .map(|rule| self.evaluate_rule(message, rule, requester))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut evaluation = Evaluation::default();
        for outcome in outcomes {
            match outcome {
                RuleOutcome::NoMatch => {}
                RuleOutcome::Suppressed => evaluation.suppressed += 1,
                RuleOutcome::Matched(notifications) => {
                    evaluation.matched_rules += 1;
                    evaluation.notifications.extend(notifications);
                }
                RuleOutcome::LookupFailed => evaluation.lookup_failures += 1,
                RuleOutcome::Failed => evaluation.rule_errors += 1,
            }
        }

        metrics::counter!("herald_rules_matched_total").increment(evaluation.matched_rules as u64);
        metrics::counter!("herald_rules_suppressed_total").increment(evaluation.suppressed as u64);
        metrics::counter!("herald_notifications_generated_total")
            .increment(evaluation.notifications.len() as u64);
        evaluation
    }

    async fn evaluate_rule(
        &self,
        message: &Message,
        rule: &CompiledRule,
        requester: &Requester,
    ) -> RuleOutcome {
        let matched = match rule.tracking.matches(message, requester).await {
            Ok(MatchResult::Matched(ctx)) => ctx,
            Ok(MatchResult::NoMatch) => return RuleOutcome::NoMatch,
            Err(e) => return rule_error(rule, message, &e),
        };

        tracing::debug!(
            rule_id = rule.id,
            predicate = rule.tracking.name(),
            message_id = %message.id,
            "Rule matched"
        );

        if message.deprecated {
            tracing::debug!(
                rule_id = rule.id,
                message_id = %message.id,
                "Deprecated message, skipping generation"
            );
            return RuleOutcome::Suppressed;
        }

        match self.generate(message, rule, &matched) {
            Ok(notifications) => RuleOutcome::Matched(notifications),
            Err(e) => rule_error(rule, message, &e),
        }
    }

    /// Run generation rules in order and build their notifications.
    fn generate(
        &self,
        message: &Message,
        rule: &CompiledRule,
        matched: &MatchContext,
    ) -> Result<Vec<Notification>, EvalError> {
        let filter_ctx = FilterContext {
            owner: &rule.owner,
            matched,
            now: Utc::now(),
        };

        let mut notifications = Vec::new();
        let mut rendered: HashMap<&str, RenderedMessage> = HashMap::new();
        let mut template_ctx = None;

        for generation in &rule.generation_rules {
            let mut passed = true;
            for filter in &generation.filters {
                if !filter.passes(message, &filter_ctx)? {
                    tracing::trace!(rule_id = rule.id, filter = filter.name(), "Filter rejected");
                    passed = false;
                    break;
                }
            }
            if !passed {
                continue;
            }

            for destination in &generation.destinations {
                let template = self.template_for(&destination.protocol);
                let content = match rendered.get(template) {
                    Some(content) => content.clone(),
                    None => {
                        let ctx = template_ctx.get_or_insert_with(|| {
                            notification_context(message, rule, matched, &self.timezone)
                        });
                        let content = self.templates.render_with_fallback(template, ctx, &rule.name);
                        rendered.insert(template, content.clone());
                        content
                    }
                };

                notifications.push(Notification {
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    owner: rule.owner.clone(),
                    message_id: message.id.clone(),
                    topic: message.topic.clone(),
                    protocol: destination.protocol.clone(),
                    address: destination.address.clone(),
                    content,
                });
            }
        }

        Ok(notifications)
    }
}

fn rule_error(rule: &CompiledRule, message: &Message, error: &EvalError) -> RuleOutcome {
    match error {
        EvalError::LookupFailed { kind, key, .. } => {
            tracing::warn!(
                rule_id = rule.id,
                kind = %kind,
                key = %key,
                message_id = %message.id,
                error = %error,
                "Lookup failed, treating rule as non-matching"
            );
            metrics::counter!("herald_rule_lookup_failures_total", "kind" => kind.as_str())
                .increment(1);
            RuleOutcome::LookupFailed
        }
        EvalError::Predicate { .. } => {
            tracing::error!(
                rule_id = rule.id,
                owner = %rule.owner,
                message_id = %message.id,
                error = %error,
                "Rule evaluation failed, skipping rule"
            );
            metrics::counter!("herald_rule_errors_total").increment(1);
            RuleOutcome::Failed
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("default_template", &self.default_template)
            .field("protocol_templates", &self.protocol_templates)
            .field("timezone", &self.timezone)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompiledTemplate;
    use crate::error::LookupError;
    use crate::requester::{Fact, FactBackend, LookupKind, RequesterSettings, StaticFactBackend};
    use crate::rules::{MemoryRuleRepository, PredicateRegistry, RuleSetLoader, parse_rules};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    fn engine() -> Arc<TemplateEngine> {
        Arc::new(TemplateEngine::new(HashMap::from([
            (
                "default".to_string(),
                CompiledTemplate {
                    title: "[{{ app_name }}] {{ summary }}".to_string(),
                    body: "rule {{ rule.id }} for {{ rule.owner }}".to_string(),
                },
            ),
            (
                "short".to_string(),
                CompiledTemplate {
                    title: "{{ summary }}".to_string(),
                    body: String::new(),
                },
            ),
        ])))
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(engine(), "default")
            .with_protocol_templates(HashMap::from([("irc".to_string(), "short".to_string())]))
            .with_concurrency(4)
    }

    async fn rule_set(yaml: &str) -> RuleSet {
        let repo = MemoryRuleRepository::new(parse_rules(yaml).unwrap());
        RuleSetLoader::new(Arc::new(repo), Arc::new(PredicateRegistry::default()))
            .load()
            .await
            .unwrap()
    }

    fn message() -> Message {
        let mut msg = Message::new("m-1", "org.fedoraproject.prod.bodhi.update.comment");
        msg.app_name = Some("bodhi".to_string());
        msg.summary = Some("bob commented on firefox".to_string());
        msg.agent_name = Some("bob".to_string());
        msg.packages.insert("firefox".to_string());
        msg
    }

    /// Backend whose every fetch fails.
    #[derive(Debug)]
    struct Unreachable(LookupKind);

    #[async_trait]
    impl FactBackend for Unreachable {
        fn kind(&self) -> LookupKind {
            self.0
        }

        async fn fetch(&self, _key: &str) -> Result<Fact, LookupError> {
            Err(LookupError::Fetch("connection refused".to_string()))
        }

        fn invalidation_signal(&self, _message: &Message) -> Vec<String> {
            Vec::new()
        }
    }

    const RULES: &str = r#"
rules:
  - id: 1
    owner: alice
    name: Firefox
    tracking_rule: {name: packages, params: {packages: [firefox]}}
    generation_rules:
      - destinations:
          - {protocol: email, address: alice@example.org}
          - {protocol: irc, address: alice}
      - destinations: [{protocol: email, address: alice-alt@example.org}]
        filters: {applications: [koji]}
  - id: 2
    owner: carol
    tracking_rule: {name: packages, params: {packages: [thunderbird]}}
    generation_rules:
      - destinations: [{protocol: email, address: carol@example.org}]
  - id: 3
    owner: bob
    tracking_rule: {name: everything}
    generation_rules:
      - destinations: [{protocol: email, address: bob@example.org}]
        filters: {my_actions: false}
"#;

    // ============================================================
    // Generation
    // ============================================================

    #[tokio::test]
    async fn matching_rules_emit_one_notification_per_destination() {
        let rules = rule_set(RULES).await;
        let requester = Requester::new(RequesterSettings::default());

        let eval = pipeline().evaluate(&message(), &rules, &requester).await;

        assert_eq!(eval.matched_rules, 2);
        let targets: Vec<_> = eval
            .notifications
            .iter()
            .map(|n| (n.rule_id, n.destination().to_string()))
            .collect();
        // Rule 1's second generation rule is filtered out; rule 3 drops
        // bob's own action.
        assert_eq!(
            targets,
            vec![
                (1, "email:alice@example.org".to_string()),
                (1, "irc:alice".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn content_uses_protocol_template_with_default_fallback() {
        let rules = rule_set(RULES).await;
        let requester = Requester::new(RequesterSettings::default());

        let eval = pipeline().evaluate(&message(), &rules, &requester).await;

        let email = &eval.notifications[0].content;
        assert_eq!(email.title, "[bodhi] bob commented on firefox");
        assert_eq!(email.body, "rule 1 for alice");
        let irc = &eval.notifications[1].content;
        assert_eq!(irc.title, "bob commented on firefox");
        assert_eq!(irc.body, "");
    }

    #[tokio::test]
    async fn deprecated_message_generates_nothing() {
        let rules = rule_set(RULES).await;
        let requester = Requester::new(RequesterSettings::default());
        let mut msg = message();
        msg.deprecated = true;

        let eval = pipeline().evaluate(&msg, &rules, &requester).await;

        assert_eq!(eval.matched_rules, 0);
        assert_eq!(eval.suppressed, 2);
        assert!(eval.notifications.is_empty());
    }

    #[tokio::test]
    async fn muted_rule_matches_but_notifies_nobody() {
        let rules = rule_set(
            r#"
rules:
  - id: 4
    owner: alice
    tracking_rule: {name: packages, params: {packages: [firefox]}}
    generation_rules:
      - destinations: [{protocol: email, address: alice@example.org}]
        filters: {muted: {}}
"#,
        )
        .await;
        let requester = Requester::new(RequesterSettings::default());
        let msg = message();

        let rule = &rules.rules()[0];
        assert!(rule.tracking.matches(&msg, &requester).await.unwrap().is_match());

        let eval = pipeline().evaluate(&msg, &rules, &requester).await;
        assert_eq!(eval.matched_rules, 1);
        assert!(eval.notifications.is_empty());
    }

    #[tokio::test]
    async fn followed_user_action_without_artifacts_notifies() {
        let rules = rule_set(
            r#"
rules:
  - id: 5
    owner: alice
    tracking_rule: {name: users-followed, params: {usernames: [bodhi]}}
    generation_rules:
      - destinations: [{protocol: email, address: a@example.com}]
"#,
        )
        .await;
        let requester = Requester::new(RequesterSettings::default());
        let mut msg = Message::new("m-2", "org.fedoraproject.prod.bodhi.update.request.testing");
        msg.agent_name = Some("bodhi".to_string());
        assert!(msg.packages.is_empty());

        let eval = pipeline().evaluate(&msg, &rules, &requester).await;

        let targets: Vec<_> = eval
            .notifications
            .iter()
            .map(|n| (n.protocol.as_str(), n.address.as_str()))
            .collect();
        assert_eq!(targets, vec![("email", "a@example.com")]);
    }

    // ============================================================
    // Failure isolation
    // ============================================================

    #[tokio::test]
    async fn lookup_failure_does_not_block_other_rules() {
        let rules = rule_set(
            r#"
rules:
  - id: 1
    owner: alice
    tracking_rule: {name: packages, params: {packages: [firefox]}}
    generation_rules:
      - destinations: [{protocol: email, address: alice@example.org}]
  - id: 2
    owner: dave
    tracking_rule: {name: group-members-followed, params: {groups: [packagers]}}
    generation_rules:
      - destinations: [{protocol: email, address: dave@example.org}]
"#,
        )
        .await;
        let requester = Requester::new(RequesterSettings::default())
            .with_backend(Arc::new(Unreachable(LookupKind::GroupMembers)));

        let eval = pipeline().evaluate(&message(), &rules, &requester).await;

        assert_eq!(eval.lookup_failures, 1);
        assert_eq!(eval.notifications.len(), 1);
        assert_eq!(eval.notifications[0].rule_id, 1);
    }

    #[tokio::test]
    async fn group_binding_reaches_template() {
        let rules = rule_set(
            r#"
rules:
  - id: 9
    owner: erin
    tracking_rule: {name: group-members-followed, params: {groups: [packagers]}}
    generation_rules:
      - destinations: [{protocol: email, address: erin@example.org}]
"#,
        )
        .await;
        let members = HashMap::from([(
            "packagers".to_string(),
            Fact::Names(BTreeSet::from(["bob".to_string()])),
        )]);
        let requester = Requester::new(RequesterSettings::default()).with_backend(Arc::new(
            StaticFactBackend::new(LookupKind::GroupMembers, members),
        ));
        let engine = Arc::new(TemplateEngine::new(HashMap::from([(
            "default".to_string(),
            CompiledTemplate {
                title: "{{ agent_name }} in {{ matched.group }}".to_string(),
                body: String::new(),
            },
        )])));

        let eval = Pipeline::new(engine, "default")
            .evaluate(&message(), &rules, &requester)
            .await;

        assert_eq!(eval.notifications.len(), 1);
        assert_eq!(eval.notifications[0].content.title, "bob in packagers");
    }
}

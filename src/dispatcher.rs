//! Per-message orchestration.
//!
//! ```text
//! received -> invalidated -> snapshot -> candidate | dropped
//!          -> evaluated -> de-duplicated -> enqueued -> done
//! ```
//!
//! The [`Requester`], [`TrackedCache`] and [`SendQueue`] are injected so
//! tests can substitute deterministic fakes.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::Instrument;

use crate::error::{DispatchError, SendError};
use crate::message::Message;
use crate::notify::{DedupeKey, SendQueue};
use crate::pipeline::Pipeline;
use crate::requester::Requester;
use crate::tracked::TrackedCache;

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not a candidate for any rule.
    Dropped,
    /// Deprecated message; a newer duplicate will generate notifications.
    Deprecated,
    Evaluated,
}

/// Outcome of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub disposition: Disposition,
    pub matched_rules: usize,
    pub enqueued: usize,
    /// Notifications suppressed as duplicates within this delivery.
    pub duplicates: usize,
    /// Notifications that could not be enqueued.
    pub send_failures: Vec<SendError>,
}

impl DispatchReport {
    fn new(disposition: Disposition) -> Self {
        Self {
            disposition,
            matched_rules: 0,
            enqueued: 0,
            duplicates: 0,
            send_failures: Vec::new(),
        }
    }

    /// True if every generated notification was enqueued.
    pub fn is_complete(&self) -> bool {
        self.send_failures.is_empty()
    }
}

/// Routes each incoming message through the cache, the pipeline and the
/// outbound queue.
pub struct Dispatcher {
    requester: Arc<Requester>,
    cache: Arc<TrackedCache>,
    pipeline: Pipeline,
    queue: Arc<dyn SendQueue>,
}

impl Dispatcher {
    pub fn new(
        requester: Arc<Requester>,
        cache: Arc<TrackedCache>,
        pipeline: Pipeline,
        queue: Arc<dyn SendQueue>,
    ) -> Self {
        Self {
            requester,
            cache,
            pipeline,
            queue,
        }
    }

    pub fn cache(&self) -> &Arc<TrackedCache> {
        &self.cache
    }

    pub fn requester(&self) -> &Arc<Requester> {
        &self.requester
    }

    /// Handle one message to completion.
    ///
    /// Cache invalidation always runs before the snapshot is read. The whole
    /// notification batch is enqueued after evaluation finishes, so a
    /// cancelled call enqueues nothing.
    ///
    /// # Errors
    /// [`DispatchError::Repository`] if rules cannot be loaded; the
    /// repository is rolled back first and the message should not be
    /// acknowledged.
    pub async fn handle(&self, message: &Message) -> Result<DispatchReport, DispatchError> {
        let span = tracing::info_span!(
            "dispatch_message",
            message_id = %message.id,
            topic = %message.topic
        );

        self.handle_inner(message).instrument(span).await
    }

    async fn handle_inner(&self, message: &Message) -> Result<DispatchReport, DispatchError> {
        metrics::counter!("herald_messages_received_total").increment(1);

        let evicted = self.requester.invalidate_on_message(message).await;
        let rebuilt = self.cache.invalidate_on_message(message, &self.requester);
        if evicted > 0 || rebuilt {
            tracing::debug!(evicted, rebuilt, "Caches invalidated");
        }

        let snapshot = match self.cache.get_tracked(&self.requester).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load rules, rolling back");
                self.cache.loader().repository().rollback().await;
                metrics::counter!("herald_dispatch_errors_total").increment(1);
                return Err(e.into());
            }
        };

        if !snapshot.tracked.is_candidate(message) {
            tracing::trace!("Message is not a candidate, dropping");
            metrics::counter!("herald_messages_dropped_total").increment(1);
            return Ok(DispatchReport::new(Disposition::Dropped));
        }

        if message.deprecated {
            tracing::debug!("Deprecated message, skipping evaluation");
            metrics::counter!("herald_messages_deprecated_total").increment(1);
            return Ok(DispatchReport::new(Disposition::Deprecated));
        }

        let evaluation = self
            .pipeline
            .evaluate(message, &snapshot.rules, &self.requester)
            .await;

        let mut report = DispatchReport::new(Disposition::Evaluated);
        report.matched_rules = evaluation.matched_rules;

        let mut seen: HashSet<DedupeKey> = HashSet::with_capacity(evaluation.notifications.len());
        for notification in evaluation.notifications {
            if !seen.insert(notification.dedupe_key()) {
                report.duplicates += 1;
                continue;
            }

            let rule_id = notification.rule_id;
            let destination = notification.destination();
            match self.queue.send(notification) {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    tracing::warn!(
                        rule_id,
                        destination = %destination,
                        error = %e,
                        "Failed to enqueue notification"
                    );
                    metrics::counter!("herald_enqueue_failures_total").increment(1);
                    report.send_failures.push(e);
                }
            }
        }

        if report.duplicates > 0 {
            metrics::counter!("herald_notifications_deduplicated_total")
                .increment(report.duplicates as u64);
        }
        if !report.is_complete() {
            tracing::error!(
                failed = report.send_failures.len(),
                enqueued = report.enqueued,
                "Some notifications could not be enqueued"
            );
        }

        tracing::debug!(
            matched_rules = report.matched_rules,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            lookup_failures = evaluation.lookup_failures,
            rule_errors = evaluation.rule_errors,
            "Message dispatched"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cache", &self.cache)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompiledTemplate;
    use crate::error::RepositoryError;
    use crate::notify::Notification;
    use crate::requester::RequesterSettings;
    use crate::rules::{
        MemoryRuleRepository, PredicateRegistry, Rule, RuleRepository, RuleSetLoader, parse_rules,
    };
    use crate::template::TemplateEngine;
    use crate::topic::TopicPattern;
    use crate::tracked::TrackedSettings;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Queue recording what it accepts, failing every `fail_every`-th send.
    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<Notification>>,
        fail_every: Option<usize>,
        calls: AtomicUsize,
    }

    impl RecordingQueue {
        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl SendQueue for RecordingQueue {
        fn send(&self, notification: Notification) -> Result<(), SendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(n) = self.fail_every
                && call % n == 0
            {
                return Err(SendError::QueueFull);
            }
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }
    }

    const RULES: &str = r#"
rules:
  - id: 1
    owner: alice
    tracking_rule: {name: packages, params: {packages: [firefox]}}
    generation_rules:
      - destinations:
          - {protocol: email, address: alice@example.org}
          - {protocol: email, address: alice@example.org}
      - destinations:
          - {protocol: email, address: alice@example.org}
          - {protocol: irc, address: alice}
  - id: 2
    owner: bob
    tracking_rule: {name: users-followed, params: {usernames: [carol]}}
    generation_rules:
      - destinations: [{protocol: email, address: bob@example.org}]
"#;

    fn dispatcher_with(
        repo: Arc<dyn RuleRepository>,
        queue: Arc<RecordingQueue>,
    ) -> Dispatcher {
        let loader = RuleSetLoader::new(repo, Arc::new(PredicateRegistry::default()));
        let settings = TrackedSettings {
            rule_change_topics: TopicPattern::compile_all(&["*.fmn.rule.*".to_string()]).unwrap(),
            max_age: None,
        };
        let templates = Arc::new(TemplateEngine::new(HashMap::from([(
            "default".to_string(),
            CompiledTemplate {
                title: "{{ topic }}".to_string(),
                body: String::new(),
            },
        )])));

        Dispatcher::new(
            Arc::new(Requester::new(RequesterSettings::default())),
            Arc::new(TrackedCache::new(loader, settings)),
            Pipeline::new(templates, "default"),
            queue,
        )
    }

    fn firefox_message(id: &str) -> Message {
        let mut msg = Message::new(id, "org.fedoraproject.prod.bodhi.update.comment");
        msg.packages.insert("firefox".to_string());
        msg
    }

    // ============================================================
    // Dispositions
    // ============================================================

    #[tokio::test]
    async fn non_candidate_is_dropped() {
        let queue = Arc::new(RecordingQueue::default());
        let repo = Arc::new(MemoryRuleRepository::new(parse_rules(RULES).unwrap()));
        let dispatcher = dispatcher_with(repo, queue.clone());

        let mut msg = Message::new("m-1", "org.fedoraproject.prod.koji.build");
        msg.packages.insert("kernel".to_string());

        let report = dispatcher.handle(&msg).await.unwrap();
        assert_eq!(report.disposition, Disposition::Dropped);
        assert!(queue.sent().is_empty());
    }

    #[tokio::test]
    async fn deprecated_candidate_enqueues_nothing() {
        let queue = Arc::new(RecordingQueue::default());
        let repo = Arc::new(MemoryRuleRepository::new(parse_rules(RULES).unwrap()));
        let dispatcher = dispatcher_with(repo, queue.clone());

        let mut msg = firefox_message("m-1");
        msg.deprecated = true;

        let report = dispatcher.handle(&msg).await.unwrap();
        assert_eq!(report.disposition, Disposition::Deprecated);
        assert!(queue.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_enqueued_once() {
        let queue = Arc::new(RecordingQueue::default());
        let repo = Arc::new(MemoryRuleRepository::new(parse_rules(RULES).unwrap()));
        let dispatcher = dispatcher_with(repo, queue.clone());

        let report = dispatcher.handle(&firefox_message("m-1")).await.unwrap();

        assert_eq!(report.disposition, Disposition::Evaluated);
        assert_eq!(report.matched_rules, 1);
        assert_eq!(report.enqueued, 2);
        assert_eq!(report.duplicates, 2);
        let sent: Vec<_> = queue
            .sent()
            .iter()
            .map(|n| n.destination().to_string())
            .collect();
        assert_eq!(sent, vec!["email:alice@example.org", "irc:alice"]);
    }

    #[tokio::test]
    async fn concurrent_deliveries_of_identical_content_each_notify() {
        let queue = Arc::new(RecordingQueue::default());
        let repo = Arc::new(MemoryRuleRepository::new(parse_rules(RULES).unwrap()));
        let dispatcher = dispatcher_with(repo, queue.clone());

        let first = firefox_message("m-1");
        let second = firefox_message("m-2");
        let (a, b) = tokio::join!(dispatcher.handle(&first), dispatcher.handle(&second));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!((a.enqueued, a.duplicates), (2, 2));
        assert_eq!((b.enqueued, b.duplicates), (2, 2));

        let mut sent: Vec<_> = queue
            .sent()
            .iter()
            .map(|n| (n.message_id.clone(), n.destination().to_string()))
            .collect();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                ("m-1".to_string(), "email:alice@example.org".to_string()),
                ("m-1".to_string(), "irc:alice".to_string()),
                ("m-2".to_string(), "email:alice@example.org".to_string()),
                ("m-2".to_string(), "irc:alice".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn followed_agent_without_artifacts_is_evaluated() {
        let queue = Arc::new(RecordingQueue::default());
        let repo = Arc::new(MemoryRuleRepository::new(parse_rules(RULES).unwrap()));
        let dispatcher = dispatcher_with(repo, queue.clone());

        let mut msg = Message::new("m-1", "org.fedoraproject.prod.bodhi.update.request.testing");
        msg.agent_name = Some("carol".to_string());

        let report = dispatcher.handle(&msg).await.unwrap();

        assert_eq!(report.disposition, Disposition::Evaluated);
        let sent: Vec<_> = queue
            .sent()
            .iter()
            .map(|n| (n.protocol.clone(), n.address.clone()))
            .collect();
        assert_eq!(sent, vec![("email".to_string(), "bob@example.org".to_string())]);
    }

    #[tokio::test]
    async fn enqueue_failures_are_reported_and_rest_still_sent() {
        let queue = Arc::new(RecordingQueue {
            fail_every: Some(1),
            ..Default::default()
        });
        let repo = Arc::new(MemoryRuleRepository::new(parse_rules(RULES).unwrap()));
        let dispatcher = dispatcher_with(repo, queue.clone());

        let report = dispatcher.handle(&firefox_message("m-1")).await.unwrap();

        // Both unique notifications were attempted.
        assert_eq!(queue.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.send_failures, vec![SendError::QueueFull; 2]);
        assert!(!report.is_complete());
    }

    // ============================================================
    // Rule changes and repository failures
    // ============================================================

    #[tokio::test]
    async fn rule_change_message_reloads_rules() {
        let queue = Arc::new(RecordingQueue::default());
        let repo = Arc::new(MemoryRuleRepository::new(Vec::new()));
        let dispatcher = dispatcher_with(repo.clone(), queue.clone());

        let report = dispatcher.handle(&firefox_message("m-1")).await.unwrap();
        assert_eq!(report.disposition, Disposition::Dropped);

        repo.replace(parse_rules(RULES).unwrap()).unwrap();
        dispatcher
            .handle(&Message::new("m-2", "org.fedoraproject.prod.fmn.rule.update"))
            .await
            .unwrap();

        let report = dispatcher.handle(&firefox_message("m-3")).await.unwrap();
        assert_eq!(report.disposition, Disposition::Evaluated);
        assert_eq!(report.enqueued, 2);
    }

    #[tokio::test]
    async fn repository_error_rolls_back_and_fails() {
        #[derive(Default)]
        struct Broken {
            rollbacks: AtomicUsize,
        }

        #[async_trait]
        impl RuleRepository for Broken {
            async fn load_enabled_rules(&self) -> Result<Vec<Rule>, RepositoryError> {
                Err(RepositoryError::Unavailable("connection reset".to_string()))
            }

            async fn rollback(&self) {
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
            }
        }

        let repo = Arc::new(Broken::default());
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = dispatcher_with(repo.clone(), queue.clone());

        let result = dispatcher.handle(&firefox_message("m-1")).await;

        assert!(matches!(result, Err(DispatchError::Repository(_))));
        assert_eq!(repo.rollbacks.load(Ordering::SeqCst), 1);
        assert!(queue.sent().is_empty());
    }
}

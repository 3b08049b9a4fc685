//! Fact backend trait definition.

use async_trait::async_trait;

use super::{Fact, LookupKind};
use crate::error::LookupError;
use crate::message::Message;
use crate::topic::{TopicPattern, any_matches};

/// A source of facts of one [`LookupKind`].
///
/// Implementations must be `Send + Sync`: one backend serves every in-flight
/// message. Timeouts are enforced by the requester, not by the backend.
///
/// # Example
///
/// ```ignore
/// struct Directory;
///
/// #[async_trait]
/// impl FactBackend for Directory {
///     fn kind(&self) -> LookupKind { LookupKind::GroupMembers }
///     async fn fetch(&self, key: &str) -> Result<Fact, LookupError> { ... }
///     fn invalidation_signal(&self, _message: &Message) -> Vec<String> { Vec::new() }
/// }
/// ```
#[async_trait]
pub trait FactBackend: Send + Sync {
    /// The kind of fact this backend serves.
    fn kind(&self) -> LookupKind;

    /// Fetch the fact for `key` from the underlying service.
    async fn fetch(&self, key: &str) -> Result<Fact, LookupError>;

    /// Keys whose cached facts this message makes stale.
    fn invalidation_signal(&self, message: &Message) -> Vec<String>;
}

/// Topic-driven invalidation shared by the built-in backends.
///
/// When a message topic matches one of the patterns, the keys it names
/// (see [`LookupKind::signalled_keys`]) are stale.
#[derive(Debug, Clone, Default)]
pub struct InvalidationPolicy {
    topics: Vec<TopicPattern>,
}

impl InvalidationPolicy {
    pub fn new(topics: Vec<TopicPattern>) -> Self {
        Self { topics }
    }

    pub fn keys(&self, kind: LookupKind, message: &Message) -> Vec<String> {
        if !any_matches(&self.topics, &message.topic) {
            return Vec::new();
        }
        kind.signalled_keys(message)
    }
}

//! Centralized error types for herald using thiserror.
//!
//! Errors are split by where they are contained: lookup and predicate errors
//! stop at the rule boundary, send errors stop at the notification boundary,
//! repository errors escape to the caller of the dispatcher.

use std::time::Duration;

use thiserror::Error;

use crate::requester::LookupKind;

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    LoadError(String),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
    #[error("invalid template '{name}': {message}")]
    InvalidTemplate { name: String, message: String },
    #[error("invalid topic pattern '{pattern}': {message}")]
    InvalidTopicPattern { pattern: String, message: String },
    #[error("rule {rule}: unknown tracking rule '{name}'")]
    UnknownTrackingRule { rule: String, name: String },
    #[error("rule {rule}: unknown filter '{name}'")]
    UnknownFilter { rule: String, name: String },
    #[error("rule {rule}: invalid params for '{predicate}': {message}")]
    InvalidParams {
        rule: String,
        predicate: String,
        message: String,
    },
    #[error("invalid sink for protocol '{protocol}': {message}")]
    InvalidSink { protocol: String, message: String },
    #[error("invalid service '{kind}': {message}")]
    InvalidService { kind: String, message: String },
}

/// Errors raised by the rule repository. Fatal for the message being handled.
#[derive(Error, Debug, Clone)]
pub enum RepositoryError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read rules: {0}")]
    Load(String),
    #[error("failed to decode rules: {0}")]
    Decode(String),
}

/// Errors raised by a fact backend while fetching a single fact.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("no backend configured for {0}")]
    NoBackend(LookupKind),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid lookup key '{0}'")]
    InvalidKey(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Errors raised while evaluating a tracking predicate or a filter.
#[derive(Error, Debug, Clone)]
pub enum EvalError {
    /// An external fact was unavailable; the predicate is treated as a non-match.
    #[error("lookup failed for {kind}:{key}: {message}")]
    LookupFailed {
        kind: LookupKind,
        key: String,
        message: String,
    },
    /// A predicate failed for an unexpected reason; the rule is skipped.
    #[error("predicate '{predicate}' failed: {message}")]
    Predicate { predicate: String, message: String },
}

/// Errors raised when enqueueing a notification on the outbound queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("outbound queue closed")]
    Closed,
}

/// Errors related to notification delivery by a sink.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("max retries exceeded")]
    MaxRetriesExceeded,
}

/// Errors related to template rendering.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template '{name}' not found")]
    NotFound { name: String },
    #[error("template render failed: {message}")]
    RenderFailed { message: String },
}

/// Errors related to reading messages from the inbound source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read message stream: {0}")]
    Read(String),
    #[error("invalid message: {0}")]
    Decode(String),
}

/// Fatal errors for the handling of one message.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

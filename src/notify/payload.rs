//! Notification payload handed to the outbound queue.

use crate::rules::{Destination, RuleId};
use crate::template::RenderedMessage;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// One notification for one destination.
///
/// Must implement `Clone` so the worker can hand it to a sink while the
/// queue keeps ownership semantics simple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub rule_id: RuleId,
    pub rule_name: String,
    /// Owner of the rule that produced this notification.
    pub owner: String,
    pub message_id: String,
    pub topic: String,
    pub protocol: String,
    pub address: String,
    pub content: RenderedMessage,
}

/// Identity used to suppress duplicate enqueues within one delivery.
pub type DedupeKey = (RuleId, String, String, String);

impl Notification {
    pub fn destination(&self) -> Destination {
        Destination::new(&self.protocol, &self.address)
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        (
            self.rule_id,
            self.protocol.clone(),
            self.address.clone(),
            self.message_id.clone(),
        )
    }
}

/// Format a timestamp for humans in the configured timezone.
///
/// Produces `"15/01/2026 11:49:35 CET"`. Subsecond precision is truncated.
/// The timezone is validated at config load; an unknown name here falls back
/// to UTC.
pub fn format_timestamp(dt: &DateTime<Utc>, timezone: &str) -> String {
    let tz: Tz = timezone.parse().unwrap_or_else(|_| {
        tracing::warn!(timezone = %timezone, "Invalid timezone, falling back to UTC");
        chrono_tz::UTC
    });

    dt.with_timezone(&tz).format("%d/%m/%Y %H:%M:%S %Z").to_string()
}

//! Notification sink trait definition.

use async_trait::async_trait;

use super::Notification;
use crate::error::NotifyError;

/// Delivers notifications for one protocol.
///
/// Implementations must be `Send + Sync` to work across async tasks.
/// Each sink manages its own retry/backoff logic internally.
///
/// # Example
///
/// ```ignore
/// use herald::notify::{Notification, NotificationSink};
///
/// struct IrcSink;
///
/// #[async_trait]
/// impl NotificationSink for IrcSink {
///     fn protocol(&self) -> &str { "irc" }
///     fn sink_type(&self) -> &str { "irc" }
///     async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Destination protocol served by this sink (e.g., "email", "irc").
    fn protocol(&self) -> &str;

    /// Kind of sink (e.g., "webhook", "stdout").
    fn sink_type(&self) -> &str;

    /// Deliver one notification.
    ///
    /// # Errors
    /// [`NotifyError`] once the sink gives up on this notification.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

impl std::fmt::Debug for dyn NotificationSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSink")
            .field("protocol", &self.protocol())
            .field("type", &self.sink_type())
            .finish()
    }
}

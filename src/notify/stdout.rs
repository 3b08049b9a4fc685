//! Sink printing one JSON line per notification.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use super::{Notification, NotificationSink};
use crate::error::NotifyError;

/// Writes notifications as newline-delimited JSON, stdout by default.
pub struct StdoutSink<W = Stdout> {
    protocol: String,
    out: Mutex<W>,
}

impl StdoutSink {
    pub fn new(protocol: &str) -> Self {
        Self::with_writer(protocol, tokio::io::stdout())
    }
}

impl<W> StdoutSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn with_writer(protocol: &str, out: W) -> Self {
        Self {
            protocol: protocol.to_string(),
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl<W> NotificationSink for StdoutSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn sink_type(&self) -> &str {
        "stdout"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(notification)
            .map_err(|e| NotifyError::SendFailed(format!("JSON serialization error: {}", e)))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| NotifyError::SendFailed(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| NotifyError::SendFailed(e.to_string()))?;

        metrics::counter!(
            "herald_notifications_sent_total",
            "protocol" => self.protocol.clone(),
            "sink_type" => "stdout"
        )
        .increment(1);
        Ok(())
    }
}

impl<W> std::fmt::Debug for StdoutSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdoutSink")
            .field("protocol", &self.protocol)
            .finish()
    }
}

//! Outbound queue and delivery worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Notification, SinkRegistry};
use crate::error::SendError;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Accepts notifications for delivery.
///
/// `send` never blocks: a full queue is reported as
/// [`SendError::QueueFull`] and left to the caller to count.
pub trait SendQueue: Send + Sync {
    fn send(&self, notification: Notification) -> Result<(), SendError>;
}

/// Bounded in-process queue backed by a tokio mpsc channel.
///
/// The queue is `Clone + Send + Sync` and can be shared across tasks.
#[derive(Debug, Clone)]
pub struct ChannelSendQueue {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSendQueue {
    /// Create a queue and the receiver a [`NotificationWorker`] drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Number of notifications waiting for the worker.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SendQueue for ChannelSendQueue {
    fn send(&self, notification: Notification) -> Result<(), SendError> {
        tracing::trace!(
            rule_id = notification.rule_id,
            destination = %notification.destination(),
            "Enqueueing notification"
        );
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })?;

        metrics::gauge!("herald_queue_size").set(self.len() as f64);
        Ok(())
    }
}

/// Drains the queue and hands each notification to the sink registered for
/// its protocol.
pub struct NotificationWorker {
    rx: mpsc::Receiver<Notification>,
    registry: Arc<SinkRegistry>,
}

impl NotificationWorker {
    pub fn new(rx: mpsc::Receiver<Notification>, registry: Arc<SinkRegistry>) -> Self {
        Self { rx, registry }
    }

    /// Run the worker loop until cancelled or every queue handle is dropped.
    pub async fn run(&mut self, cancel: CancellationToken) {
        tracing::debug!("Notification worker started");

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    match received {
                        Some(notification) => {
                            self.deliver(notification).await;
                            metrics::gauge!("herald_queue_size").set(self.rx.len() as f64);
                        }
                        None => {
                            tracing::debug!("Notification queue closed");
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(
                        pending = self.rx.len(),
                        "Notification worker shutting down gracefully"
                    );
                    return;
                }
            }
        }
    }

    async fn deliver(&self, notification: Notification) {
        let span = tracing::info_span!(
            "deliver_notification",
            rule_id = notification.rule_id,
            protocol = %notification.protocol,
            message_id = %notification.message_id
        );

        async {
            let Some(sink) = self.registry.get(&notification.protocol) else {
                tracing::error!(
                    address = %notification.address,
                    "No sink registered for protocol, dropping notification"
                );
                metrics::counter!(
                    "herald_notify_errors_total",
                    "protocol" => notification.protocol.clone(),
                    "sink_type" => "unknown"
                )
                .increment(1);
                return;
            };

            match sink.send(&notification).await {
                Ok(()) => {
                    tracing::info!(sink_type = %sink.sink_type(), "Notification sent");
                }
                Err(e) => {
                    // Sinks record their own failure metrics.
                    tracing::error!(
                        error = %e,
                        sink_type = %sink.sink_type(),
                        address = %notification.address,
                        "Failed to deliver notification"
                    );
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for NotificationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationWorker")
            .field("registry", &self.registry)
            .finish()
    }
}

/// Calculate exponential backoff delay.
///
/// Formula: min(base * 2^attempt, max)
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = base.saturating_mul(2_u32.saturating_pow(attempt));
    std::cmp::min(delay, max)
}

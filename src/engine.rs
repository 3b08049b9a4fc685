//! Consumer loop: pulls messages from a source and dispatches them.
//!
//! # Architecture
//!
//! ```text
//! main.rs
//!     |
//!     v
//! engine.rs (Consumer) --> source.rs --> dispatcher.rs --> pipeline.rs --> notify/
//! ```
//!
//! Messages are processed one at a time to completion. A message is
//! acknowledged only once the dispatcher returns without a fatal error.
//!
//! # Example
//!
//! ```ignore
//! use herald::engine::Consumer;
//! use tokio_util::sync::CancellationToken;
//!
//! let consumer = Consumer::new(Arc::new(dispatcher));
//! let stats = consumer.run(&mut source, CancellationToken::new()).await?;
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, Disposition};
use crate::error::SourceError;
use crate::source::MessageSource;

/// Totals for one consumer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub dropped: u64,
    pub deprecated: u64,
    pub evaluated: u64,
    pub enqueued: u64,
    pub send_failures: u64,
    /// Messages not acknowledged because dispatching failed.
    pub failed: u64,
}

/// Drives a [`Dispatcher`] from a [`MessageSource`].
#[derive(Debug)]
pub struct Consumer {
    dispatcher: Arc<Dispatcher>,
}

impl Consumer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Run until the source is exhausted or `cancel` fires.
    ///
    /// A message interrupted by cancellation is nacked; nothing was
    /// enqueued for it.
    ///
    /// # Errors
    /// Propagates source read and ack errors.
    pub async fn run<S>(
        &self,
        source: &mut S,
        cancel: CancellationToken,
    ) -> Result<ConsumerStats, SourceError>
    where
        S: MessageSource + ?Sized,
    {
        let mut stats = ConsumerStats::default();
        tracing::info!("Consumer started");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Consumer shutting down gracefully");
                    break;
                }
                next = source.next_message() => match next? {
                    Some(message) => message,
                    None => {
                        tracing::info!("Message source exhausted");
                        break;
                    }
                },
            };
            stats.received += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(message_id = %message.id, "Shutdown interrupted message handling");
                    source.nack(&message).await?;
                    break;
                }
                result = self.dispatcher.handle(&message) => result,
            };

            match result {
                Ok(report) => {
                    match report.disposition {
                        Disposition::Dropped => stats.dropped += 1,
                        Disposition::Deprecated => stats.deprecated += 1,
                        Disposition::Evaluated => stats.evaluated += 1,
                    }
                    stats.enqueued += report.enqueued as u64;
                    stats.send_failures += report.send_failures.len() as u64;
                    source.ack(&message).await?;
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %message.id,
                        error = %e,
                        "Dispatch failed, message not acknowledged"
                    );
                    stats.failed += 1;
                    source.nack(&message).await?;
                }
            }
        }

        tracing::info!(
            received = stats.received,
            evaluated = stats.evaluated,
            enqueued = stats.enqueued,
            failed = stats.failed,
            "Consumer stopped"
        );
        Ok(stats)
    }
}

//! Outbound notification delivery.
//!
//! The dispatcher enqueues [`Notification`]s on a [`SendQueue`]; a
//! [`NotificationWorker`] drains the queue and routes each notification to
//! the [`NotificationSink`] registered for its destination protocol.
//!
//! ```text
//! dispatcher -> SendQueue -> NotificationWorker -> SinkRegistry -> sinks
//! ```
//!
//! - **Non-blocking send**: a full queue is reported, never waited on
//! - **Retries**: sinks own their backoff policy
//! - **Graceful shutdown**: the worker stops on a cancellation token

mod payload;
mod queue;
mod registry;
mod stdout;
mod traits;
pub mod webhook;

pub use payload::{DedupeKey, Notification, format_timestamp};
pub use queue::{
    ChannelSendQueue, DEFAULT_QUEUE_CAPACITY, NotificationWorker, SendQueue, backoff_delay,
};
pub use registry::SinkRegistry;
pub use stdout::StdoutSink;
pub use traits::NotificationSink;
pub use webhook::WebhookSink;

//! herald - match bus messages against user notification rules and dispatch
//! the resulting notifications.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod message;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod requester;
pub mod rules;
pub mod source;
pub mod template;
pub mod topic;
pub mod tracked;

// Re-export commonly used types
pub use cli::LogFormat;
pub use dispatcher::{DispatchReport, Dispatcher, Disposition};
pub use engine::{Consumer, ConsumerStats};
pub use message::Message;
pub use metrics::{MetricsServer, register_metric_descriptions};
pub use notify::{
    ChannelSendQueue, DEFAULT_QUEUE_CAPACITY, Notification, NotificationSink, NotificationWorker,
    SendQueue, SinkRegistry, backoff_delay,
};
pub use pipeline::{Evaluation, Pipeline};
pub use requester::Requester;
pub use source::{JsonLinesSource, MessageSource};
pub use template::{RenderedMessage, TemplateEngine};
pub use tracked::{Snapshot, TrackedCache};

//! Inbound message sources.
//!
//! The bus transport itself is external; herald consumes anything that can
//! hand out [`Message`]s one at a time and accept an ack or nack for each.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::error::SourceError;
use crate::message::Message;

/// A stream of messages with at-least-once delivery.
#[async_trait]
pub trait MessageSource: Send {
    /// The next message, or `None` once the source is exhausted.
    async fn next_message(&mut self) -> Result<Option<Message>, SourceError>;

    /// The message was fully handled.
    async fn ack(&mut self, _message: &Message) -> Result<(), SourceError> {
        Ok(())
    }

    /// The message was not handled and should be redelivered.
    async fn nack(&mut self, _message: &Message) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Newline-delimited JSON messages read from any async reader.
///
/// Blank lines are ignored. Lines that do not decode into a [`Message`] are
/// logged, counted and skipped. Acks and nacks are only logged: there is no
/// broker to redeliver to.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_number: u64,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }
}

/// Decode one JSON line into a message.
pub fn decode_message(line: &str) -> Result<Message, SourceError> {
    serde_json::from_str(line).map_err(|e| SourceError::Decode(e.to_string()))
}

#[async_trait]
impl<R> MessageSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_message(&mut self) -> Result<Option<Message>, SourceError> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(|e| SourceError::Read(e.to_string()))?
            else {
                return Ok(None);
            };
            self.line_number += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match decode_message(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!(
                        line = self.line_number,
                        error = %e,
                        "Skipping undecodable message"
                    );
                    metrics::counter!("herald_messages_invalid_total").increment(1);
                }
            }
        }
    }

    async fn ack(&mut self, message: &Message) -> Result<(), SourceError> {
        tracing::trace!(message_id = %message.id, "Message acknowledged");
        Ok(())
    }

    async fn nack(&mut self, message: &Message) -> Result<(), SourceError> {
        tracing::warn!(message_id = %message.id, "Message not acknowledged");
        Ok(())
    }
}

impl<R> std::fmt::Debug for JsonLinesSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSource")
            .field("line_number", &self.line_number)
            .finish()
    }
}

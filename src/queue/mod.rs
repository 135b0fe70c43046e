//! Producer/consumer seam around an at-least-once queue.
//!
//! Envelopes travel as JSON bodies. The consumer side hands out [`Delivery`]
//! values carrying the broker's attempt counter; the worker decodes, processes and
//! then settles each delivery with `ack` or `retry`.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PublishError;
use crate::event::{scope_for, DedupKey, EventKind, InboundEvent, Scope};

pub use memory::MemoryQueue;

/// A normalized event plus delivery metadata, as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub dedup_key: String,
    pub kind: EventKind,
    pub channel: String,
    pub user: String,
    /// Normalized text (mentions stripped, whitespace collapsed)
    pub text: String,
    pub timestamp: String,
    /// 1-based delivery attempt, stamped by the consumer
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEnvelope {
    pub fn from_event(event: &InboundEvent, key: &DedupKey) -> Self {
        Self {
            dedup_key: key.to_string(),
            kind: event.kind,
            channel: event.origin.channel.clone(),
            user: event.origin.user.clone(),
            text: event.normalized_text(),
            timestamp: event.timestamp.clone(),
            attempt: 0,
            workspace: event.origin.workspace.clone(),
            thread: event.origin.thread.clone(),
            enqueued_at: Utc::now(),
        }
    }

    /// The dedup key, if the envelope carries a usable one.
    pub fn key(&self) -> Option<DedupKey> {
        let key = self.dedup_key.trim();
        (!key.is_empty()).then(|| DedupKey::new(key))
    }

    pub fn scope(&self) -> Scope {
        scope_for(self.kind, &self.channel)
    }
}

/// One handout of a queued message to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    /// How many times this message has been handed out, including this one
    pub attempt: u32,
    pub body: String,
}

impl Delivery {
    /// Decode the body and stamp the attempt counter onto the envelope.
    pub fn decode(&self) -> Result<QueueEnvelope, serde_json::Error> {
        let mut envelope: QueueEnvelope = serde_json::from_str(&self.body)?;
        envelope.attempt = self.attempt;
        Ok(envelope)
    }
}

/// What happened to a delivery handed back with `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Redelivered { after: Duration },
    DeadLettered,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub attempts: u32,
    pub body: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Hand an envelope to the queue. Returns once the queue has accepted it.
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<(), PublishError>;
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Wait for the next delivery. `None` once the queue is closed.
    async fn receive(&self) -> Option<Delivery>;

    /// Processing finished; never deliver this message again.
    async fn ack(&self, delivery: &Delivery);

    /// Processing failed transiently. The message becomes visible again after a
    /// backoff, or moves to the dead-letter store once the attempt budget is spent.
    async fn retry(&self, delivery: Delivery, reason: &str) -> RetryDisposition;
}

/// Lazy sequence of deliveries. Dropping the stream and calling this again picks
/// up where the queue left off; anything received but never settled is the
/// queue's to redeliver.
pub fn deliveries(consumer: Arc<dyn QueueConsumer>) -> BoxStream<'static, Delivery> {
    Box::pin(stream::unfold(consumer, |consumer| async move {
        let delivery = consumer.receive().await?;
        Some((delivery, consumer))
    }))
}

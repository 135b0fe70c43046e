use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{DeadLetter, Delivery, QueueConsumer, QueueEnvelope, QueuePublisher, RetryDisposition};
use crate::error::PublishError;

/// Dead letters kept unless configured otherwise.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 1000;

struct Message {
    id: Uuid,
    body: String,
    /// Handouts so far
    deliveries: u32,
}

impl Message {
    fn into_delivery(self) -> Delivery {
        Delivery {
            id: self.id,
            attempt: self.deliveries + 1,
            body: self.body,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

/// In-process bounded queue with at-least-once semantics: retried messages are
/// re-enqueued after a linear backoff and dead-lettered after `max_attempts`
/// handouts. Only the most recent `dead_letter_limit` dead letters are kept.
pub struct MemoryQueue {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    closed: watch::Sender<bool>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_limit: usize,
    max_attempts: u32,
    backoff: Duration,
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

impl MemoryQueue {
    pub fn new(capacity: usize, max_attempts: u32, backoff: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_limit: DEFAULT_DEAD_LETTER_LIMIT,
            max_attempts: max_attempts.max(1),
            backoff,
            published: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit.max(1);
        self
    }

    /// Refuse new publishes. `receive` keeps handing out what is already
    /// buffered, then returns `None`. Redeliveries still in backoff are lost.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl QueuePublisher for MemoryQueue {
    async fn publish(&self, envelope: &QueueEnvelope) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }
        let message = Message {
            id: Uuid::new_v4(),
            body: serde_json::to_string(envelope)?,
            deliveries: 0,
        };
        let id = message.id;
        // Waits while the queue is full; the receiver bounds this with a timeout.
        self.tx.send(message).await.map_err(|_| PublishError::Closed)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %id, dedup_key = %envelope.dedup_key, "envelope published");
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn receive(&self) -> Option<Delivery> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        if *closed.borrow_and_update() {
            return rx.try_recv().ok().map(Message::into_delivery);
        }

        let message = tokio::select! {
            message = rx.recv() => message,
            _ = closed.wait_for(|closed| *closed) => None,
        };
        // Closed while waiting: drain whatever is buffered.
        message.or_else(|| rx.try_recv().ok()).map(Message::into_delivery)
    }

    async fn ack(&self, delivery: &Delivery) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %delivery.id, attempt = delivery.attempt, "delivery acknowledged");
    }

    async fn retry(&self, delivery: Delivery, reason: &str) -> RetryDisposition {
        if delivery.attempt >= self.max_attempts {
            error!(
                message_id = %delivery.id,
                attempts = delivery.attempt,
                reason,
                "retry budget exhausted, dead-lettering"
            );
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            let mut dead_letters = self.dead_letters.lock().await;
            if dead_letters.len() >= self.dead_letter_limit {
                dead_letters.pop_front();
            }
            dead_letters.push_back(DeadLetter {
                id: delivery.id,
                attempts: delivery.attempt,
                body: delivery.body,
                reason: reason.to_string(),
                at: Utc::now(),
            });
            return RetryDisposition::DeadLettered;
        }

        let after = self.backoff * delivery.attempt;
        warn!(
            message_id = %delivery.id,
            attempt = delivery.attempt,
            backoff_ms = after.as_millis() as u64,
            reason,
            "delivery failed, scheduling redelivery"
        );
        self.redelivered.fetch_add(1, Ordering::Relaxed);

        let tx = self.tx.clone();
        let message = Message {
            id: delivery.id,
            body: delivery.body,
            deliveries: delivery.attempt,
        };
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if tx.send(message).await.is_err() {
                warn!("queue dropped before redelivery");
            }
        });

        RetryDisposition::Redelivered { after }
    }
}

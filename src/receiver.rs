//! Ingress: turn a platform payload into a queued envelope within the ack
//! deadline.
//!
//! The receiver validates and normalizes first, so a malformed payload never
//! touches the dedup store or the queue. Its dedup check is optimistic; the
//! dispatcher owns the authoritative one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dedup::{DedupStatus, Deduplicator};
use crate::error::{MalformedEventError, PublishError};
use crate::event::{DedupKey, EventKind, InboundEvent, Origin};
use crate::queue::{QueueEnvelope, QueuePublisher};

/// An inbound request body as handed over by the HTTP layer.
#[derive(Debug, Clone)]
pub enum RawPayload {
    /// Events API JSON body
    Event(String),
    /// Form fields of a slash command invocation
    SlashCommand(HashMap<String, String>),
}

/// Successful acknowledgment returned to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResponse {
    /// Queued for processing
    Accepted,
    /// Already seen within the retention window; nothing queued
    Duplicate,
    /// Valid but not something the bot acts on (bot messages, edits, ...)
    Ignored,
    /// Endpoint verification handshake
    Challenge(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("acknowledgment deadline of {0:?} exceeded")]
    Deadline(Duration),
}

/// Result of parsing a payload, before any side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Challenge(String),
    Ignored(&'static str),
    Event(InboundEvent),
}

pub struct EventReceiver {
    dedup: Arc<Deduplicator>,
    publisher: Arc<dyn QueuePublisher>,
    ack_deadline: Duration,
    publish_timeout: Duration,
    dedup_timeout: Duration,
}

impl EventReceiver {
    pub fn new(
        dedup: Arc<Deduplicator>,
        publisher: Arc<dyn QueuePublisher>,
        ack_deadline: Duration,
        publish_timeout: Duration,
        dedup_timeout: Duration,
    ) -> Self {
        Self {
            dedup,
            publisher,
            ack_deadline,
            publish_timeout,
            dedup_timeout,
        }
    }

    /// Validate, dedup and enqueue one payload.
    ///
    /// Store and queue calls run under the ack deadline. If the deadline fires
    /// while this call holds an ingress mark, the mark is released in the
    /// background so the platform's retry is queued instead of suppressed.
    pub async fn accept(&self, payload: RawPayload) -> Result<AckResponse, ReceiveError> {
        let event = match parse(&payload)? {
            Parsed::Challenge(challenge) => return Ok(AckResponse::Challenge(challenge)),
            Parsed::Ignored(why) => {
                debug!(reason = why, "payload ignored");
                return Ok(AckResponse::Ignored);
            }
            Parsed::Event(event) => event,
        };

        let key = event.dedup_key();
        let marked = AtomicBool::new(false);
        match tokio::time::timeout(self.ack_deadline, self.enqueue(&event, &key, &marked)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    dedup_key = %key,
                    deadline_ms = self.ack_deadline.as_millis() as u64,
                    "ack deadline exceeded"
                );
                if marked.load(Ordering::SeqCst) {
                    self.release_in_background(key);
                }
                Err(ReceiveError::Deadline(self.ack_deadline))
            }
        }
    }

    async fn enqueue(
        &self,
        event: &InboundEvent,
        key: &DedupKey,
        marked: &AtomicBool,
    ) -> Result<AckResponse, ReceiveError> {
        match tokio::time::timeout(self.dedup_timeout, self.dedup.check_and_mark(key)).await {
            Ok(Ok(DedupStatus::AlreadySeen)) => {
                info!(dedup_key = %key, kind = %event.kind, "duplicate delivery acknowledged");
                return Ok(AckResponse::Duplicate);
            }
            Ok(Ok(DedupStatus::FirstSeen)) => marked.store(true, Ordering::SeqCst),
            // The dispatcher check still catches real duplicates.
            Ok(Err(e)) => warn!(dedup_key = %key, error = %e, "ingress dedup check failed, treating as new"),
            Err(_) => {
                // A blocked store call can still land after we stop waiting.
                marked.store(true, Ordering::SeqCst);
                warn!(
                    dedup_key = %key,
                    timeout_ms = self.dedup_timeout.as_millis() as u64,
                    "ingress dedup check timed out, treating as new"
                );
            }
        }

        let envelope = QueueEnvelope::from_event(event, key);
        let published = match tokio::time::timeout(self.publish_timeout, self.publisher.publish(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        };

        if let Err(e) = published {
            warn!(dedup_key = %key, error = %e, "publish failed");
            // Let the platform's own retry through.
            if marked.load(Ordering::SeqCst) {
                self.release(key).await;
            }
            return Err(e.into());
        }

        info!(
            dedup_key = %key,
            kind = %event.kind,
            channel = %event.origin.channel,
            "event accepted"
        );
        Ok(AckResponse::Accepted)
    }

    async fn release(&self, key: &DedupKey) {
        match tokio::time::timeout(self.dedup_timeout, self.dedup.release(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(dedup_key = %key, error = %e, "failed to release ingress mark"),
            Err(_) => warn!(dedup_key = %key, "timed out releasing ingress mark"),
        }
    }

    fn release_in_background(&self, key: DedupKey) {
        let dedup = self.dedup.clone();
        tokio::spawn(async move {
            if let Err(e) = dedup.release(&key).await {
                warn!(dedup_key = %key, error = %e, "failed to release ingress mark");
            }
        });
    }
}

/// Parse and normalize a payload without touching any shared state.
pub fn parse(payload: &RawPayload) -> Result<Parsed, MalformedEventError> {
    match payload {
        RawPayload::Event(body) => {
            let value: Value =
                serde_json::from_str(body).map_err(|e| MalformedEventError::InvalidJson(e.to_string()))?;
            parse_event_body(&value)
        }
        RawPayload::SlashCommand(form) => parse_slash_command(form).map(Parsed::Event),
    }
}

fn parse_event_body(value: &Value) -> Result<Parsed, MalformedEventError> {
    match required(value, "type")? {
        "url_verification" => Ok(Parsed::Challenge(required(value, "challenge")?.to_string())),
        "event_callback" => {
            let event = value
                .get("event")
                .filter(|e| e.is_object())
                .ok_or(MalformedEventError::MissingField("event"))?;
            let workspace = optional(value, "team_id");
            let event_id = optional(value, "event_id");
            parse_inner_event(event, workspace, event_id)
        }
        other => Err(MalformedEventError::UnsupportedType(other.to_string())),
    }
}

fn parse_inner_event(
    event: &Value,
    workspace: Option<String>,
    event_id: Option<String>,
) -> Result<Parsed, MalformedEventError> {
    let event_type = required(event, "type")?;

    // Loop guard: never react to bots, including ourselves.
    if event.get("bot_id").is_some() {
        return Ok(Parsed::Ignored("bot message"));
    }

    match event_type {
        "app_mention" => message_event(EventKind::Mention, event, workspace, event_id),
        "message" => {
            if event.get("subtype").is_some() {
                return Ok(Parsed::Ignored("message subtype"));
            }
            // Channel messages only matter when they mention the bot, and those
            // arrive separately as app_mention.
            if optional(event, "channel_type").as_deref() != Some("im") {
                return Ok(Parsed::Ignored("non-dm message"));
            }
            message_event(EventKind::DirectMessage, event, workspace, event_id)
        }
        "reaction_added" => {
            let item = event.get("item").ok_or(MalformedEventError::MissingField("item"))?;
            let channel = required(item, "channel")?.to_string();
            let user = required(event, "user")?.to_string();
            let reaction = required(event, "reaction")?.to_string();
            let timestamp = optional(event, "event_ts")
                .or_else(|| optional(item, "ts"))
                .ok_or(MalformedEventError::MissingField("event_ts"))?;
            Ok(Parsed::Event(InboundEvent {
                kind: EventKind::Reaction,
                origin: Origin {
                    workspace,
                    channel,
                    user,
                    thread: optional(item, "ts"),
                },
                text: reaction,
                timestamp,
                source_id: event_id,
            }))
        }
        // Only subscribed types arrive; anything else is acknowledged and dropped.
        _ => Ok(Parsed::Ignored("unhandled event type")),
    }
}

fn message_event(
    kind: EventKind,
    event: &Value,
    workspace: Option<String>,
    event_id: Option<String>,
) -> Result<Parsed, MalformedEventError> {
    let channel = required(event, "channel")?.to_string();
    let user = required(event, "user")?.to_string();
    let timestamp = required(event, "ts")?.to_string();
    let text = optional(event, "text").unwrap_or_default();
    let thread = optional(event, "thread_ts").filter(|parent| *parent != timestamp);

    Ok(Parsed::Event(InboundEvent {
        kind,
        origin: Origin {
            workspace,
            channel,
            user,
            thread,
        },
        text,
        timestamp,
        source_id: event_id,
    }))
}

fn parse_slash_command(form: &HashMap<String, String>) -> Result<InboundEvent, MalformedEventError> {
    let form_field = |name: &'static str| -> Result<String, MalformedEventError> {
        form.get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(MalformedEventError::MissingField(name))
    };

    let channel = form_field("channel_id")?;
    let user = form_field("user_id")?;
    let command = form_field("command")?;
    let args = form.get("text").map(|t| t.trim()).unwrap_or_default();

    // "/incident" + "123" routes like a mention saying "incident 123".
    let text = format!("{} {}", command.trim_start_matches('/'), args);
    let now = Utc::now();

    Ok(InboundEvent {
        kind: EventKind::SlashCommand,
        origin: Origin {
            workspace: form.get("team_id").cloned().filter(|t| !t.is_empty()),
            channel,
            user,
            thread: None,
        },
        text,
        timestamp: format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros()),
        source_id: form.get("trigger_id").cloned().filter(|t| !t.is_empty()),
    })
}

fn required<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, MalformedEventError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(MalformedEventError::MissingField(field))
}

fn optional(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

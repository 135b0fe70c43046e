use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width of the timestamp bucket used when an event has no source id.
pub const FINGERPRINT_BUCKET_SECS: i64 = 60;

/// What kind of platform event produced an [`InboundEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Mention,
    DirectMessage,
    Reaction,
    SlashCommand,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Mention => "mention",
            EventKind::DirectMessage => "direct_message",
            EventKind::Reaction => "reaction",
            EventKind::SlashCommand => "slash_command",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context restriction under which a plugin is eligible to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Channel,
    Dm,
    #[default]
    Any,
}

impl Scope {
    /// Whether a plugin declared with `self` may handle an event in `event_scope`.
    pub fn admits(&self, event_scope: Scope) -> bool {
        match self {
            Scope::Any => true,
            declared => event_scope == Scope::Any || *declared == event_scope,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Channel => f.write_str("channel"),
            Scope::Dm => f.write_str("dm"),
            Scope::Any => f.write_str("any"),
        }
    }
}

/// Where an event came from on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Workspace (team) id
    pub workspace: Option<String>,
    /// Channel or DM conversation id
    pub channel: String,
    /// User who triggered the event
    pub user: String,
    /// Parent thread timestamp, when the event happened inside a thread
    pub thread: Option<String>,
}

/// A platform event after parsing, before normalization into a queue envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub origin: Origin,
    /// The raw text as sent by the platform
    pub text: String,
    /// Source timestamp (Slack `ts` format, seconds with a fractional part)
    pub timestamp: String,
    /// Source-provided unique id, e.g. `event_id` or a slash command `trigger_id`
    pub source_id: Option<String>,
}

impl InboundEvent {
    /// Text with user mentions removed and whitespace collapsed.
    pub fn normalized_text(&self) -> String {
        normalize_text(&self.text)
    }

    /// Derive the identity used for duplicate detection.
    pub fn dedup_key(&self) -> DedupKey {
        if let Some(id) = self.source_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return DedupKey(format!("src:{}", id.trim()));
        }

        let bucket = timestamp_secs(&self.timestamp)
            .map(|secs| secs.div_euclid(FINGERPRINT_BUCKET_SECS))
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        for part in [
            self.kind.as_str(),
            &self.origin.channel,
            &self.origin.user,
            &self.normalized_text(),
            &bucket.to_string(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        DedupKey(format!("fp:{}", hex::encode(hasher.finalize())))
    }
}

/// Deterministic identity of a logical event. Two events with equal keys are the
/// same event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events in DM conversations (Slack ids starting with `D`) are DM-scoped.
pub fn scope_for(kind: EventKind, channel: &str) -> Scope {
    if kind == EventKind::DirectMessage || channel.starts_with('D') {
        Scope::Dm
    } else {
        Scope::Channel
    }
}

/// Strip `<@U123>` style mentions and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<@") {
        out.push_str(&rest[..start]);
        match rest[start..].find('>') {
            Some(end) => {
                out.push(' ');
                rest = &rest[start + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whole seconds of a Slack-style `1700000000.000100` timestamp.
fn timestamp_secs(ts: &str) -> Option<i64> {
    let whole = ts.split('.').next()?;
    whole.trim().parse().ok()
}

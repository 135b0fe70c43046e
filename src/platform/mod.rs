pub mod slack;

use async_trait::async_trait;
use tracing::info;

use crate::error::SendError;
use crate::event::EventKind;
use crate::plugins::{PluginResponse, ResponseTarget};
use crate::queue::QueueEnvelope;

/// Concrete place a response is posted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Channel id, DM conversation id, or a user id (opens a DM)
    pub channel: String,
    /// Parent message timestamp when replying in a thread
    pub thread: Option<String>,
}

impl Destination {
    /// Work out where `response` goes for the event in `envelope`.
    pub fn resolve(envelope: &QueueEnvelope, response: &PluginResponse) -> Self {
        if let Some(channel) = &response.channel {
            return Self {
                channel: channel.clone(),
                thread: None,
            };
        }

        match response.target {
            ResponseTarget::DirectMessage => Self {
                channel: envelope.user.clone(),
                thread: None,
            },
            ResponseTarget::SameChannel => Self {
                channel: envelope.channel.clone(),
                thread: envelope.thread.clone(),
            },
            ResponseTarget::Thread => {
                // Slash commands and reactions have no message of their own to
                // thread under.
                let parent = match envelope.kind {
                    EventKind::Mention | EventKind::DirectMessage => envelope
                        .thread
                        .clone()
                        .or_else(|| Some(envelope.timestamp.clone())),
                    EventKind::SlashCommand | EventKind::Reaction => envelope.thread.clone(),
                };
                Self {
                    channel: envelope.channel.clone(),
                    thread: parent.filter(|ts| !ts.is_empty()),
                }
            }
        }
    }
}

/// Delivers a plugin response to the platform.
#[async_trait]
pub trait ResponseSender: Send + Sync {
    async fn send(&self, destination: &Destination, response: &PluginResponse) -> Result<(), SendError>;
}

/// Sender used when no bot token is configured: responses are only logged.
pub struct LogSender;

#[async_trait]
impl ResponseSender for LogSender {
    async fn send(&self, destination: &Destination, response: &PluginResponse) -> Result<(), SendError> {
        info!(
            channel = %destination.channel,
            thread = ?destination.thread,
            "would send: {}",
            response.text
        );
        Ok(())
    }
}

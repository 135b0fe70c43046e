pub mod builtin;
pub mod registry;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::ProcessingError;
use crate::event::Scope;
use crate::queue::QueueEnvelope;

pub use registry::{PatternType, PluginDescriptor, PluginRegistry};
pub use router::{Captures, PluginRouter};

/// A named, pattern-matched handler.
///
/// The router and dispatcher only ever see this trait; concrete plugins are
/// looked up by handler name in a [`HandlerCatalog`] at startup.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Handle a matched event. `Ok(None)` means "handled, nothing to say".
    async fn process(&self, input: PluginInput) -> Result<Option<PluginResponse>, PluginError>;

    /// One-line usage shown by the help plugin.
    fn usage(&self) -> Option<&str> {
        None
    }
}

/// Everything a plugin gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct PluginInput {
    pub event: QueueEnvelope,
    /// Text that satisfied the pattern
    pub matched: String,
    pub captures: Captures,
    /// Enabled plugins, in configured order
    pub catalog: Arc<[PluginSummary]>,
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A dependency was unavailable or slow; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bad input or a bug; retrying will not help.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl From<PluginError> for ProcessingError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Transient(msg) => ProcessingError::Retryable(msg),
            PluginError::Fatal(msg) => ProcessingError::NonRetryable(msg),
        }
    }
}

/// Where a response should go relative to the triggering event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseTarget {
    /// Reply in the thread of the triggering message
    #[default]
    Thread,
    /// Post at the top level of the same channel
    SameChannel,
    /// Send a direct message to the triggering user
    DirectMessage,
}

/// What a plugin wants sent back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginResponse {
    /// Plain text; also the notification fallback when blocks are present
    pub text: String,
    /// Block Kit payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<serde_json::Value>,
    pub target: ResponseTarget,
    /// Explicit destination channel, overriding `target`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Follow-up messages sent in order after this one, usually to another
    /// channel or as a DM. Their own `additional` lists are not sent.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<PluginResponse>,
}

impl PluginResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            blocks: None,
            target: ResponseTarget::default(),
            channel: None,
            additional: Vec::new(),
        }
    }

    pub fn with_blocks(mut self, blocks: serde_json::Value) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn to(mut self, target: ResponseTarget) -> Self {
        self.target = target;
        self
    }

    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Queue a follow-up message after this one.
    pub fn also(mut self, response: PluginResponse) -> Self {
        self.additional.push(response);
        self
    }
}

/// Public facts about an enabled plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub description: String,
    pub scope: Scope,
    pub usage: Option<String>,
}

/// Handler implementations available to configuration, keyed by handler name.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn Plugin>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in handler registered.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("ping", Arc::new(builtin::PingPlugin));
        catalog.register("help", Arc::new(builtin::HelpPlugin));
        catalog.register("status", Arc::new(builtin::StatusPlugin::new()));
        catalog.register("incident", Arc::new(builtin::IncidentPlugin));
        catalog
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn Plugin>) {
        info!("Registered plugin handler: {}", name);
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.handlers.get(name).cloned()
    }
}

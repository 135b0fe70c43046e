//! Built-in plugin handlers.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use super::{Plugin, PluginError, PluginInput, PluginResponse, ResponseTarget};

/// Connectivity check; always answers the same thing.
pub struct PingPlugin;

#[async_trait]
impl Plugin for PingPlugin {
    async fn process(&self, input: PluginInput) -> Result<Option<PluginResponse>, PluginError> {
        info!(user = %input.event.user, "ping");
        Ok(Some(PluginResponse::text("Pong!").to(ResponseTarget::SameChannel)))
    }

    fn usage(&self) -> Option<&str> {
        Some("ping - replies with pong to check the bot is alive")
    }
}

/// Lists every enabled plugin with its description.
pub struct HelpPlugin;

#[async_trait]
impl Plugin for HelpPlugin {
    async fn process(&self, input: PluginInput) -> Result<Option<PluginResponse>, PluginError> {
        let mut lines = Vec::new();
        for plugin in input.catalog.iter() {
            let line = match (&plugin.usage, plugin.description.is_empty()) {
                (Some(usage), _) => format!("• `{}`", usage),
                (None, false) => format!("• *{}*: {}", plugin.name, plugin.description),
                (None, true) => format!("• *{}*", plugin.name),
            };
            lines.push(line);
        }
        if lines.is_empty() {
            return Ok(Some(PluginResponse::text("No plugins are enabled.")));
        }

        let listing = lines.join("\n");
        let blocks = json!([
            { "type": "header", "text": { "type": "plain_text", "text": "Available commands" } },
            { "type": "section", "text": { "type": "mrkdwn", "text": listing } },
        ]);
        Ok(Some(
            PluginResponse::text(format!("Available commands:\n{}", listing)).with_blocks(blocks),
        ))
    }

    fn usage(&self) -> Option<&str> {
        Some("help - lists what the bot can do")
    }
}

/// Reports uptime and build information.
pub struct StatusPlugin {
    started: Instant,
}

impl StatusPlugin {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for StatusPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for StatusPlugin {
    async fn process(&self, input: PluginInput) -> Result<Option<PluginResponse>, PluginError> {
        let uptime = self.started.elapsed().as_secs();
        let uptime = format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60);
        let checked = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

        let blocks = json!([
            { "type": "header", "text": { "type": "plain_text", "text": "Bot Status" } },
            { "type": "section", "text": { "type": "mrkdwn", "text": "*Status:* [OPERATIONAL]" } },
            { "type": "section", "fields": [
                { "type": "mrkdwn", "text": format!("*Version:*\n{}", env!("CARGO_PKG_VERSION")) },
                { "type": "mrkdwn", "text": format!("*Uptime:*\n{}", uptime) },
                { "type": "mrkdwn", "text": format!("*Plugins:*\n{}", input.catalog.len()) },
                { "type": "mrkdwn", "text": format!("*Last check:*\n{}", checked) },
            ]},
        ]);

        Ok(Some(
            PluginResponse::text(format!("Bot status: operational, up {}", uptime))
                .with_blocks(blocks),
        ))
    }

    fn usage(&self) -> Option<&str> {
        Some("status - shows bot health and uptime")
    }
}

/// Looks up an incident by number. Expects the number as the first capture
/// group (or a group named `id`).
pub struct IncidentPlugin;

const STATUSES: [&str; 4] = ["Open", "In Progress", "Resolved", "Closed"];
const PRIORITIES: [&str; 4] = ["Low", "Medium", "High", "Critical"];
const ASSIGNEES: [&str; 4] = ["John Doe", "Jane Smith", "Mike Johnson", "Sarah Wilson"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentRecord {
    pub id: String,
    pub title: String,
    pub status: &'static str,
    pub priority: &'static str,
    pub assignee: &'static str,
}

impl IncidentPlugin {
    /// Stand-in for the incident tracker: stable data derived from the number.
    pub fn lookup(id: &str) -> Result<IncidentRecord, PluginError> {
        let n: u64 = id
            .parse()
            .map_err(|_| PluginError::Fatal(format!("incident id '{}' is not a number", id)))?;
        let pick = |len: usize, salt: u64| (n.wrapping_mul(31).wrapping_add(salt) % len as u64) as usize;
        Ok(IncidentRecord {
            id: id.to_string(),
            title: format!("System Incident #{}", id),
            status: STATUSES[pick(STATUSES.len(), 0)],
            priority: PRIORITIES[pick(PRIORITIES.len(), 1)],
            assignee: ASSIGNEES[pick(ASSIGNEES.len(), 2)],
        })
    }

    fn blocks(record: &IncidentRecord) -> Value {
        json!([
            { "type": "header", "text": { "type": "plain_text", "text": format!("Incident #{}", record.id) } },
            { "type": "section", "text": { "type": "mrkdwn", "text": format!("*{}*", record.title) } },
            { "type": "section", "fields": [
                { "type": "mrkdwn", "text": format!("*Status:* [{}] {}", record.status.to_uppercase(), record.status) },
                { "type": "mrkdwn", "text": format!("*Priority:* [{}] {}", record.priority.to_uppercase(), record.priority) },
                { "type": "mrkdwn", "text": format!("*Assigned to:* {}", record.assignee) },
            ]},
        ])
    }
}

#[async_trait]
impl Plugin for IncidentPlugin {
    async fn process(&self, input: PluginInput) -> Result<Option<PluginResponse>, PluginError> {
        let id = input
            .captures
            .name("id")
            .or_else(|| input.captures.get(1))
            .map(str::to_string);

        let Some(id) = id else {
            return Ok(Some(PluginResponse::text(
                "I couldn't find an incident number. Expected format: `incident 123`",
            )));
        };

        info!(incident = %id, "fetching incident");
        let record = Self::lookup(&id)?;
        Ok(Some(
            PluginResponse::text(format!("Incident #{}: {}", record.id, record.status))
                .with_blocks(Self::blocks(&record)),
        ))
    }

    fn usage(&self) -> Option<&str> {
        Some("incident <number> - shows details for an incident")
    }
}

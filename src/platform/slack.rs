use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Destination, ResponseSender};
use crate::config::SlackConfig;
use crate::error::SendError;
use crate::plugins::PluginResponse;

/// Slack truncates `text` past this many characters.
const MAX_TEXT_LEN: usize = 4000;

/// Split long messages at newline or space boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocks: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts responses through the Slack Web API `chat.postMessage` method.
pub struct SlackSender {
    client: reqwest::Client,
    config: SlackConfig,
}

impl SlackSender {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post(&self, request: &PostMessageRequest<'_>) -> Result<(), SendError> {
        let url = format!("{}/chat.postMessage", self.config.api_base_url.trim_end_matches('/'));
        debug!("Sending request to Slack: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.bot_token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Api(format!("HTTP {}: {}", status, body)));
        }

        let api: SlackApiResponse = response.json().await?;
        if !api.ok {
            return Err(SendError::Api(
                api.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseSender for SlackSender {
    async fn send(&self, destination: &Destination, response: &PluginResponse) -> Result<(), SendError> {
        let chunks = split_message(&response.text, MAX_TEXT_LEN);
        for (i, chunk) in chunks.iter().enumerate() {
            let request = PostMessageRequest {
                channel: &destination.channel,
                text: chunk,
                // Blocks ride on the first chunk only
                blocks: if i == 0 { response.blocks.as_ref() } else { None },
                thread_ts: destination.thread.as_deref(),
            };
            self.post(&request).await?;
        }
        info!(
            channel = %destination.channel,
            chunks = chunks.len(),
            "response sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_prefers_whitespace() {
        let chunks = split_message("alpha beta gamma", 11);
        assert_eq!(chunks, vec!["alpha beta ".to_string(), "gamma".to_string()]);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "ééééé";
        let chunks = split_message(text, 3);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| c.len() <= 3));
    }

    #[test]
    fn test_post_body_shape() {
        let blocks = serde_json::json!([{ "type": "divider" }]);
        let request = PostMessageRequest {
            channel: "C1",
            text: "hi",
            blocks: Some(&blocks),
            thread_ts: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["channel"], "C1");
        assert!(body.get("thread_ts").is_none());
        assert_eq!(body["blocks"][0]["type"], "divider");
    }
}

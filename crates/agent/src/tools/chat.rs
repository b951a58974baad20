use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_core::{AppConfig, ToolArguments};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::tools::{decode_arguments, Tool, ToolError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API error: {0}")]
    Api(String),
    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatReceipt {
    pub channel: String,
    pub ts: String,
}

#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> Result<ChatReceipt, ChatError>;
}

/// Channel ids are passed through; anything else is treated as a channel name.
pub fn is_channel_id(channel: &str) -> bool {
    channel.starts_with(['C', 'G', 'D'])
}

/// Slack Web API sender authenticated with a bot token.
pub struct SlackChatSender {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl SlackChatSender {
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_owned(), token })
    }

    /// Returns `None` when no chat token is configured.
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>, ChatError> {
        let Some(token) = config.tools.chat_token.clone() else {
            return Ok(None);
        };
        Self::new(
            config.tools.chat_base_url.clone(),
            token,
            Duration::from_secs(config.llm.timeout_secs),
        )
        .map(Some)
    }

    async fn resolve_channel(&self, channel: &str) -> Result<String, ChatError> {
        if is_channel_id(channel) {
            return Ok(channel.to_owned());
        }
        let name = channel.trim_start_matches('#');
        let mut cursor: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/conversations.list", self.base_url))
                .bearer_auth(self.token.expose_secret())
                .query(&[("types", "public_channel,private_channel"), ("limit", "200")]);
            if let Some(cursor) = cursor.as_deref() {
                request = request.query(&[("cursor", cursor)]);
            }
            let page: ConversationsList = request.send().await?.json().await?;
            if !page.ok {
                return Err(ChatError::Api(page.error.unwrap_or_else(|| "unknown_error".to_owned())));
            }
            if let Some(found) = page.channels.into_iter().find(|entry| entry.name == name) {
                debug!(event_name = "chat.channel_resolved", channel = name, id = %found.id, "resolved chat channel");
                return Ok(found.id);
            }
            cursor = page
                .response_metadata
                .and_then(|metadata| metadata.next_cursor)
                .filter(|next| !next.is_empty());
            if cursor.is_none() {
                return Err(ChatError::ChannelNotFound(channel.to_owned()));
            }
        }
    }
}

#[async_trait]
impl ChatSender for SlackChatSender {
    async fn send(&self, channel: &str, text: &str) -> Result<ChatReceipt, ChatError> {
        let channel_id = self.resolve_channel(channel).await?;
        let response: PostMessageResponse = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(self.token.expose_secret())
            .json(&json!({ "channel": channel_id, "text": text }))
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            return Err(ChatError::Api(response.error.unwrap_or_else(|| "unknown_error".to_owned())));
        }
        Ok(ChatReceipt { channel: channel_id, ts: response.ts.unwrap_or_default() })
    }
}

#[derive(Debug, Deserialize)]
struct ConversationsList {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    channels: Vec<ChannelEntry>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    error: Option<String>,
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageArgs {
    text: String,
    channel: Option<String>,
}

pub struct SendChatMessageTool {
    sender: Arc<dyn ChatSender>,
    default_channel: String,
}

impl SendChatMessageTool {
    pub fn new(sender: Arc<dyn ChatSender>, default_channel: impl Into<String>) -> Self {
        Self { sender, default_channel: default_channel.into() }
    }
}

#[async_trait]
impl Tool for SendChatMessageTool {
    fn name(&self) -> &'static str {
        "send_chat_message"
    }

    fn description(&self) -> &'static str {
        "Send a message to a chat channel"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The message text to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Channel name (with or without #) or channel id. Defaults to the configured channel."
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let args: SendMessageArgs = decode_arguments(self.name(), arguments)?;
        let channel = args
            .channel
            .filter(|channel| !channel.trim().is_empty())
            .unwrap_or_else(|| self.default_channel.clone());
        let receipt = self.sender.send(&channel, &args.text).await?;
        info!(event_name = "chat.message_sent", channel = %channel, ts = %receipt.ts, "chat message sent");
        Ok(Value::String(format!(
            "Successfully sent message to {channel}. Message timestamp: {}",
            receipt.ts
        )))
    }
}

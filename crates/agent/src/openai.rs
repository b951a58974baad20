//! OpenAI-compatible HTTP collaborators: chat completions with function calling, and embeddings.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use concierge_core::{AppConfig, ChatMessage, ToolArguments};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::llm::{Completion, CompletionClient, CompletionRequest, ToolInvocation, ToolSchema};
use crate::retrieval::Embedder;

const ERROR_BODY_PREVIEW_CHARS: usize = 300;

#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    embedding_model: String,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for completion service")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key,
            model: model.into(),
            embedding_model: embedding_model.into(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = config
            .llm
            .api_key
            .clone()
            .filter(|key| !key.expose_secret().trim().is_empty())
            .ok_or_else(|| {
                anyhow!("llm.api_key is not set; export OPENAI_API_KEY or CONCIERGE_LLM_API_KEY")
            })?;
        Self::new(
            config.llm.base_url.clone(),
            api_key,
            config.llm.model.clone(),
            config.llm.embedding_model.clone(),
            Duration::from_secs(config.llm.timeout_secs),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(&self, path: &str, body: &Value) -> Result<String> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        let text = response.text().await.with_context(|| format!("reading body from {url}"))?;
        if !status.is_success() {
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
            return Err(anyhow!("{url} returned HTTP {}: {preview}", status.as_u16()));
        }
        Ok(text)
    }
}

fn message_to_openai(message: &ChatMessage) -> Value {
    json!({ "role": message.role.as_str(), "content": message.content })
}

fn tool_to_openai(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

pub(crate) fn build_chat_body(model: &str, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": model,
        "temperature": request.temperature,
        "messages": request.messages.iter().map(message_to_openai).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(tool_to_openai).collect());
        body["tool_choice"] = json!("auto");
    }
    body
}

/// Tool-call arguments arrive as JSON text; anything that is not a JSON object becomes empty.
pub(crate) fn parse_arguments(name: &str, raw: &str) -> ToolArguments {
    if raw.trim().is_empty() {
        return ToolArguments::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!(event_name = "llm.tool_arguments_not_object", tool = name, value = %other, "tool arguments were not an object");
            ToolArguments::new()
        }
        Err(error) => {
            warn!(event_name = "llm.tool_arguments_unparseable", tool = name, error = %error, "tool arguments were not valid JSON");
            ToolArguments::new()
        }
    }
}

pub(crate) fn parse_chat_response(raw: &str) -> Result<Completion> {
    let response: ChatResponse =
        serde_json::from_str(raw).context("failed to parse chat completion response")?;
    let Some(message) = response.choices.into_iter().next().and_then(|choice| choice.message)
    else {
        return Ok(Completion::default());
    };

    let tool_invocations = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let arguments = parse_arguments(&call.function.name, &call.function.arguments);
            ToolInvocation::new(call.function.name, arguments)
        })
        .collect();

    Ok(Completion { text: message.content, tool_invocations })
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = build_chat_body(&self.model, &request);
        debug!(
            event_name = "llm.request",
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending chat completion"
        );
        let raw = self.post("chat/completions", &body).await?;
        parse_chat_response(&raw)
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({ "model": self.embedding_model, "input": text });
        let raw = self.post("embeddings", &body).await?;
        let response: EmbeddingResponse =
            serde_json::from_str(&raw).context("failed to parse embedding response")?;
        response
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| anyhow!("embedding response contained no vectors"))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use concierge_core::{AppConfig, ChatMessage};
    use serde_json::json;

    use super::{build_chat_body, parse_arguments, parse_chat_response, OpenAiClient};
    use crate::llm::{CompletionRequest, ToolSchema};

    #[test]
    fn chat_body_carries_function_tools() {
        let request = CompletionRequest::new(
            vec![ChatMessage::system("be brief"), ChatMessage::user("Calculate 2 + 2")],
            0.0,
        )
        .with_tools(vec![ToolSchema {
            name: "calculator".to_owned(),
            description: "Evaluate arithmetic".to_owned(),
            parameters: json!({"type": "object", "properties": {"expr": {"type": "string"}}}),
        }]);

        let body = build_chat_body("gpt-4o-mini", &request);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Calculate 2 + 2");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "calculator");

        let plain = build_chat_body("m", &CompletionRequest::new(vec![ChatMessage::user("x")], 0.0));
        assert!(plain.get("tools").is_none());
    }

    #[test]
    fn tool_calls_are_parsed_from_json_text() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "calculator", "arguments": "{\"expr\": \"2 + 2\"}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "list_events", "arguments": "not json"}}
                    ]
                }
            }]
        })
        .to_string();

        let completion = parse_chat_response(&raw).expect("parse");
        assert!(completion.text.is_none());
        assert_eq!(completion.tool_invocations.len(), 2);
        assert_eq!(completion.tool_invocations[0].arguments["expr"], "2 + 2");
        assert!(completion.tool_invocations[1].arguments.is_empty());
    }

    #[test]
    fn text_replies_and_empty_choices_are_handled() {
        let raw = json!({"choices": [{"message": {"content": "rag"}}]}).to_string();
        assert_eq!(parse_chat_response(&raw).expect("parse").text.as_deref(), Some("rag"));

        let empty = parse_chat_response("{\"choices\": []}").expect("parse");
        assert!(empty.text.is_none() && empty.tool_invocations.is_empty());

        assert!(parse_chat_response("<html>").is_err());
    }

    #[test]
    fn non_object_arguments_become_empty() {
        assert!(parse_arguments("t", "[1, 2]").is_empty());
        assert!(parse_arguments("t", "").is_empty());
        assert_eq!(parse_arguments("t", "{\"k\": 5}")["k"], 5);
    }

    #[test]
    fn client_requires_an_api_key() {
        let config = AppConfig::default();
        let error = OpenAiClient::from_config(&config).err().expect("missing key");
        assert!(error.to_string().contains("OPENAI_API_KEY"));

        let client = OpenAiClient::new(
            "https://api.example.test/v1/",
            "sk-test".to_owned().into(),
            "gpt-4o-mini",
            "text-embedding-3-small",
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(client.model(), "gpt-4o-mini");
    }
}

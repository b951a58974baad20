use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use concierge_core::{ChatMessage, ToolArguments};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Function-calling contract for one tool, as offered to the completion service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: ToolArguments,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self { name: name.into(), arguments }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self { messages, tools: Vec::new(), temperature }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    pub text: Option<String>,
    pub tool_invocations: Vec<ToolInvocation>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_invocations: Vec::new() }
    }

    pub fn tool_calls(tool_invocations: Vec<ToolInvocation>) -> Self {
        Self { text: None, tool_invocations }
    }

    /// The trimmed text, or an empty string when the service returned none.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().map(str::trim).unwrap_or_default()
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

#[async_trait]
impl<T> CompletionClient for Arc<T>
where
    T: CompletionClient + ?Sized,
{
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        (**self).complete(request).await
    }
}

/// Replays a fixed script of completions in order and keeps every request it was given.
///
/// Once the script runs out, every further call returns `fallback` (an empty completion unless
/// set with [`ScriptedCompletionClient::with_fallback`]).
#[derive(Clone, Default)]
pub struct ScriptedCompletionClient {
    script: Arc<Mutex<VecDeque<Result<Completion, String>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    fallback: Completion,
}

impl ScriptedCompletionClient {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Completion>,
    {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().map(Ok).collect())),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, fallback: Completion) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push(&self, completion: Completion) {
        lock(&self.script).push_back(Ok(completion));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        lock(&self.script).push_back(Err(message.into()));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        lock(&self.requests).push(request);
        match lock(&self.script).pop_front() {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

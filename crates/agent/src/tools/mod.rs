use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::ToolArguments;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::llm::ToolSchema;

pub mod calculator;
pub mod calendar;
pub mod chat;
pub mod search;

pub use calculator::CalculatorTool;
pub use calendar::{CalendarStore, ClearEventsTool, CreateEventTool, ListEventsTool};
pub use chat::{ChatSender, SendChatMessageTool, SlackChatSender};
pub use search::SearchDocumentsTool;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error(transparent)]
    Calculator(#[from] calculator::CalculatorError),
    #[error(transparent)]
    Calendar(#[from] calendar::CalendarError),
    #[error("Failed to send message: {0}")]
    Chat(#[from] chat::ChatError),
    #[error("backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: self.parameters(),
        }
    }
}

/// Decodes a loosely typed argument object into a tool's parameter struct.
pub fn decode_arguments<T>(tool: &str, arguments: ToolArguments) -> Result<T, ToolError>
where
    T: DeserializeOwned,
{
    serde_json::from_value(Value::Object(arguments)).map_err(|error| ToolError::InvalidArguments {
        tool: tool.to_owned(),
        reason: error.to_string(),
    })
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|tool| tool.schema()).collect();
        schemas.sort_by(|left, right| left.name.cmp(&right.name));
        schemas
    }

    pub async fn invoke(&self, name: &str, arguments: ToolArguments) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_owned()))?;
        tool.execute(arguments).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use concierge_core::ToolArguments;
    use serde::Deserialize;
    use serde_json::{json, Value};

    use super::{decode_arguments, Tool, ToolError, ToolRegistry};

    struct EchoTool;

    #[derive(Deserialize)]
    struct EchoArgs {
        text: String,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the text back"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }

        async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
            let args: EchoArgs = decode_arguments(self.name(), arguments)?;
            Ok(Value::String(args.text))
        }
    }

    struct SilentTool;

    #[async_trait]
    impl Tool for SilentTool {
        fn name(&self) -> &'static str {
            "another"
        }

        fn description(&self) -> &'static str {
            "Does nothing"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _arguments: ToolArguments) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn args(value: Value) -> ToolArguments {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn registry_invokes_by_name() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool);
        registry.register(SilentTool);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["another".to_owned(), "echo".to_owned()]);
        assert_eq!(registry.schemas()[1].name, "echo");

        let value = registry.invoke("echo", args(json!({"text": "hi"}))).await.expect("echo");
        assert_eq!(value, json!("hi"));
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_arguments_are_errors() {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool);

        let unknown = registry.invoke("teleport", ToolArguments::new()).await;
        assert!(matches!(unknown, Err(ToolError::UnknownTool(ref name)) if name == "teleport"));

        let invalid = registry.invoke("echo", args(json!({"text": 5}))).await;
        assert!(matches!(invalid, Err(ToolError::InvalidArguments { ref tool, .. }) if tool == "echo"));
    }
}

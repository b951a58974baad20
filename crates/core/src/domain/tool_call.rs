use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type ToolArguments = Map<String, Value>;

pub const ERROR_PREFIX: &str = "Error: ";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

impl ToolOutcome {
    pub fn failure(message: impl Display) -> Self {
        Self::Failure(format!("{ERROR_PREFIX}{message}"))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Plain-text rendering used for observations and answer synthesis.
    pub fn to_text(&self) -> String {
        match self {
            Self::Success(Value::String(text)) => text.clone(),
            Self::Success(value) => value.to_string(),
            Self::Failure(message) => message.clone(),
        }
    }
}

/// One entry of the per-run tool audit trail. Never mutated after it is appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: ToolArguments,
    pub result: ToolOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn new(name: impl Into<String>, arguments: ToolArguments, result: ToolOutcome) -> Self {
        Self { name: name.into(), arguments, result, timestamp: Utc::now() }
    }

    /// Exact name + argument equality, the only notion of "same call" the agent uses.
    pub fn is_same_call(&self, name: &str, arguments: &ToolArguments) -> bool {
        self.name == name && &self.arguments == arguments
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Node {
    Initialize,
    Guard,
    Route,
    Retrieval,
    ToolLoop,
    Finalize,
    Done,
}

impl Node {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Guard => "guard",
            Self::Route => "route",
            Self::Retrieval => "retrieval",
            Self::ToolLoop => "tool_loop",
            Self::Finalize => "finalize",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three branches the router may pick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    Retrieval,
    Tool,
    Finalize,
}

impl RouteDecision {
    /// Parses the literal decision token. Anything other than `rag`, `tool` or `finalize`
    /// (case-insensitive, surrounding whitespace and quotes ignored) is rejected.
    pub fn parse_token(raw: &str) -> Option<Self> {
        let token = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();
        match token.to_ascii_lowercase().as_str() {
            "rag" => Some(Self::Retrieval),
            "tool" => Some(Self::Tool),
            "finalize" => Some(Self::Finalize),
            _ => None,
        }
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Self::Retrieval => "rag",
            Self::Tool => "tool",
            Self::Finalize => "finalize",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    Initialized,
    GuardPassed,
    GuardRefused,
    Routed(RouteDecision),
    WorkCompleted,
    Finalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Node,
    pub to: Node,
    pub event: NodeEvent,
}

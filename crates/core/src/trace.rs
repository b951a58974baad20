use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tool_call::ToolArguments;
use crate::domain::truncate_chars;
use crate::flows::states::{Node, RouteDecision};

const SUMMARY_CONTENT_CHARS: usize = 150;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactStep {
    Thought,
    Action,
    Observation,
    FinalAnswer,
}

impl ReactStep {
    pub fn label(self) -> &'static str {
        match self {
            Self::Thought => "THOUGHT",
            Self::Action => "ACTION",
            Self::Observation => "OBSERVATION",
            Self::FinalAnswer => "FINAL ANSWER",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceKind {
    NodeEntry { node: Node },
    NodeExit { node: Node },
    RouteDecided { decision: RouteDecision },
    ReactStep { step: ReactStep, content: String },
    ToolCall { name: String, arguments: ToolArguments, result_preview: String, duration_ms: u64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: String,
    pub kind: TraceKind,
    pub recorded_at: DateTime<Utc>,
}

impl TraceEvent {
    pub fn new(run_id: impl Into<String>, kind: TraceKind) -> Self {
        Self { run_id: run_id.into(), kind, recorded_at: Utc::now() }
    }
}

/// Append-only diagnostics writer for a single run. Recording never affects run behaviour.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn record(&self, _event: TraceEvent) {}
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryTraceSink {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl InMemoryTraceSink {
    pub fn events(&self) -> Vec<TraceEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(events) => events.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> String {
        render_summary(&self.events())
    }
}

impl TraceSink for InMemoryTraceSink {
    fn record(&self, event: TraceEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

pub fn render_summary(events: &[TraceEvent]) -> String {
    if events.is_empty() {
        return "No trace data".to_owned();
    }

    let mut out = String::from("=== Agent Execution Trace ===");
    for event in events {
        let at = event.recorded_at.format("%H:%M:%S");
        let _ = match &event.kind {
            TraceKind::NodeEntry { node } => write!(out, "\n[{at}] ENTER: {node}"),
            TraceKind::NodeExit { node } => write!(out, "\n[{at}] EXIT: {node}"),
            TraceKind::RouteDecided { decision } => {
                write!(out, "\n[{at}] ROUTE: {}", decision.as_token())
            }
            TraceKind::ReactStep { step, content } => write!(
                out,
                "\n[{at}] {}: {}",
                step.label(),
                truncate_chars(content, SUMMARY_CONTENT_CHARS)
            ),
            TraceKind::ToolCall { name, arguments, duration_ms, .. } => write!(
                out,
                "\n[{at}] TOOL: {name}({}) {duration_ms}ms",
                serde_json::Value::Object(arguments.clone())
            ),
        };
    }
    out
}

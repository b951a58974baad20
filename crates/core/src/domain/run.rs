use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::chunk::Chunk;
use crate::domain::tool_call::{ToolArguments, ToolCallRecord};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Mutable state for one query, owned by a single run from Initialize to Finalize.
///
/// Fields are private so the run-level invariants hold on every path:
/// - `iteration_count` only moves forward, one step per completed unit of work.
/// - `citations` only ever names sources of the chunks currently held.
/// - `tool_calls` is append-only.
/// - once sealed, the answer is masked and no longer changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    run_id: RunId,
    query: String,
    retrieved_chunks: Vec<Chunk>,
    final_answer: Option<String>,
    citations: BTreeSet<String>,
    tool_calls: Vec<ToolCallRecord>,
    messages: Vec<ChatMessage>,
    iteration_count: u32,
    sealed: bool,
}

impl RunState {
    pub fn new(query: impl Into<String>) -> Self {
        Self::with_run_id(RunId::generate(), query)
    }

    pub fn with_run_id(run_id: RunId, query: impl Into<String>) -> Self {
        Self {
            run_id,
            query: query.into(),
            retrieved_chunks: Vec::new(),
            final_answer: None,
            citations: BTreeSet::new(),
            tool_calls: Vec::new(),
            messages: Vec::new(),
            iteration_count: 0,
            sealed: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn retrieved_chunks(&self) -> &[Chunk] {
        &self.retrieved_chunks
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    pub fn citations(&self) -> &BTreeSet<String> {
        &self.citations
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn has_answer(&self) -> bool {
        self.final_answer.as_deref().is_some_and(|answer| !answer.trim().is_empty())
    }

    pub fn replace_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    /// Replaces the held chunks. Citations from an earlier retrieval are dropped with them.
    pub fn set_retrieval(&mut self, chunks: Vec<Chunk>) {
        self.retrieved_chunks = chunks;
        self.citations.clear();
    }

    pub fn cite_retrieved_sources(&mut self) {
        self.citations = self.retrieved_chunks.iter().map(|chunk| chunk.source.clone()).collect();
    }

    pub fn clear_citations(&mut self) {
        self.citations.clear();
    }

    pub fn set_answer(&mut self, answer: impl Into<String>) -> Result<(), DomainError> {
        if self.sealed {
            return Err(DomainError::AnswerSealed { run_id: self.run_id.0.clone() });
        }
        self.final_answer = Some(answer.into());
        Ok(())
    }

    pub fn record_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_calls.push(record);
    }

    pub fn has_called(&self, name: &str, arguments: &ToolArguments) -> bool {
        self.tool_calls.iter().any(|record| record.is_same_call(name, arguments))
    }

    pub fn complete_iteration(&mut self) {
        self.iteration_count = self.iteration_count.saturating_add(1);
    }

    /// Masks the answer (substituting `fallback` when none was drafted) and appends it to the
    /// transcript. Sealing twice is a no-op.
    pub fn seal_answer<F>(&mut self, mask: F, fallback: &str)
    where
        F: Fn(&str) -> String,
    {
        if self.sealed {
            return;
        }
        let draft = match self.final_answer.take() {
            Some(answer) if !answer.trim().is_empty() => answer,
            _ => fallback.to_owned(),
        };
        let masked = mask(&draft);
        self.messages.push(ChatMessage::assistant(masked.clone()));
        self.final_answer = Some(masked);
        self.sealed = true;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::domain::chunk::Chunk;
    use crate::domain::run::{Role, RunState};
    use crate::domain::tool_call::{ToolArguments, ToolCallRecord, ToolOutcome};
    use crate::errors::DomainError;

    fn args(value: serde_json::Value) -> ToolArguments {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn fresh_state_is_empty() {
        let state = RunState::new("What is the relocation allowance?");

        assert_eq!(state.query(), "What is the relocation allowance?");
        assert!(state.retrieved_chunks().is_empty());
        assert!(state.final_answer().is_none());
        assert!(state.citations().is_empty());
        assert!(state.tool_calls().is_empty());
        assert!(state.messages().is_empty());
        assert_eq!(state.iteration_count(), 0);
        assert!(state.run_id().0.starts_with("run-"));
    }

    #[test]
    fn citations_follow_the_current_retrieval() {
        let mut state = RunState::new("q");
        state.set_retrieval(vec![
            Chunk::new("a", "handbook.md"),
            Chunk::new("b", "handbook.md"),
            Chunk::new("c", "travel.md"),
        ]);
        state.cite_retrieved_sources();
        assert_eq!(state.citations().len(), 2);

        state.set_retrieval(vec![Chunk::new("d", "benefits.md")]);
        assert!(state.citations().is_empty());

        state.cite_retrieved_sources();
        assert!(state.citations().contains("benefits.md"));
        state.clear_citations();
        assert!(state.citations().is_empty());
    }

    #[test]
    fn sealing_masks_once_and_appends_assistant_message() {
        let mut state = RunState::new("q");
        state.set_answer("reach me at a@b.co").expect("answer before seal");
        state.seal_answer(|text| text.replace("a@b.co", "[REDACTED_EMAIL]"), "fallback");

        assert_eq!(state.final_answer(), Some("reach me at [REDACTED_EMAIL]"));
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].role, Role::Assistant);

        state.seal_answer(|_| "changed".to_owned(), "fallback");
        assert_eq!(state.messages().len(), 1);
        assert!(matches!(state.set_answer("late"), Err(DomainError::AnswerSealed { .. })));
    }

    #[test]
    fn sealing_without_draft_uses_fallback() {
        let mut state = RunState::new("q");
        state.set_answer("   ").expect("answer before seal");
        state.seal_answer(str::to_owned, "No answer available.");

        assert_eq!(state.final_answer(), Some("No answer available."));
        assert!(state.has_answer());
    }

    #[test]
    fn tool_history_detects_repeated_calls() {
        let mut state = RunState::new("q");
        state.record_tool_call(ToolCallRecord::new(
            "calculator",
            args(json!({"expr": "2 + 2"})),
            ToolOutcome::Success(json!(4)),
        ));
        state.complete_iteration();

        assert!(state.has_called("calculator", &args(json!({"expr": "2 + 2"}))));
        assert!(!state.has_called("calculator", &args(json!({"expr": "2 + 3"}))));
        assert_eq!(state.iteration_count(), 1);
    }
}

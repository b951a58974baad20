use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use concierge_core::domain::truncate_chars;
use concierge_core::{
    ChatMessage, ReactStep, RunState, ToolCallRecord, ToolOutcome, TraceEvent, TraceKind,
    TraceSink,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::llm::{CompletionClient, CompletionRequest};
use crate::prompts;
use crate::tools::ToolRegistry;

pub const EMPTY_SYNTHESIS_ANSWER: &str =
    "I was unable to produce an answer from the tool results.";

/// Why the loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// The completion service answered without requesting a tool.
    Answered,
    /// A proposed call repeated an earlier one with identical arguments.
    DuplicateCall { name: String },
    HopsExhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopOutcome {
    pub answer: String,
    pub exit: LoopExit,
    pub hops: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToolLoopSettings {
    pub max_tool_hops: u32,
    pub temperature: f32,
    pub observation_max_chars: usize,
}

impl Default for ToolLoopSettings {
    fn default() -> Self {
        Self { max_tool_hops: 3, temperature: 0.0, observation_max_chars: 500 }
    }
}

/// Bounded ReAct loop over the tool registry.
///
/// Every attempted invocation is appended to the run's `tool_calls` before the next one is
/// checked, so a repeat inside one batch is caught as well as a repeat across hops or across
/// earlier tool-loop visits in the same run.
pub struct ToolLoop {
    client: Arc<dyn CompletionClient>,
    registry: Arc<ToolRegistry>,
    settings: ToolLoopSettings,
}

impl ToolLoop {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        registry: Arc<ToolRegistry>,
        settings: ToolLoopSettings,
    ) -> Self {
        Self { client, registry, settings }
    }

    pub fn settings(&self) -> ToolLoopSettings {
        self.settings
    }

    pub async fn run(&self, state: &mut RunState, sink: &dyn TraceSink) -> Result<LoopOutcome> {
        let run_id = state.run_id().0.clone();
        let query = state.query().to_owned();
        let schemas = self.registry.schemas();
        let tool_names = self.registry.names().join(", ");

        let mut messages = vec![ChatMessage::system(prompts::react_system_prompt(&tool_names))];
        let mut scratchpad = String::new();

        for hop in 1..=self.settings.max_tool_hops {
            messages.push(ChatMessage::user(prompts::react_user_prompt(&query, &scratchpad)));
            let request = CompletionRequest::new(messages.clone(), self.settings.temperature)
                .with_tools(schemas.clone());
            let completion = self.client.complete(request).await?;

            if completion.tool_invocations.is_empty() {
                let answer = completion.text_or_empty().to_owned();
                if answer.is_empty() {
                    warn!(event_name = "tool_loop.empty_reply", run_id = %run_id, hop, "no tool call and no text; synthesizing");
                    return self.synthesize(state, sink, LoopExit::Answered, hop).await;
                }
                record_step(sink, &run_id, ReactStep::FinalAnswer, &answer);
                info!(event_name = "tool_loop.answered", run_id = %run_id, hop, "tool loop produced an answer");
                return Ok(LoopOutcome { answer, exit: LoopExit::Answered, hops: hop });
            }

            let thought = completion.text_or_empty();
            if !thought.is_empty() {
                record_step(sink, &run_id, ReactStep::Thought, thought);
            }

            for invocation in completion.tool_invocations {
                if state.has_called(&invocation.name, &invocation.arguments) {
                    warn!(
                        event_name = "tool_loop.duplicate_call",
                        run_id = %run_id,
                        tool = %invocation.name,
                        "repeated tool call; stopping the loop"
                    );
                    let exit = LoopExit::DuplicateCall { name: invocation.name };
                    return self.synthesize(state, sink, exit, hop).await;
                }

                let arguments_json = Value::Object(invocation.arguments.clone());
                record_step(
                    sink,
                    &run_id,
                    ReactStep::Action,
                    &format!("{}({arguments_json})", invocation.name),
                );

                let started = Instant::now();
                let outcome =
                    match self.registry.invoke(&invocation.name, invocation.arguments.clone()).await
                    {
                        Ok(value) => ToolOutcome::Success(value),
                        Err(error) => {
                            warn!(
                                event_name = "tool_loop.tool_failed",
                                run_id = %run_id,
                                tool = %invocation.name,
                                error = %error,
                                "tool call failed"
                            );
                            ToolOutcome::failure(error)
                        }
                    };
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                let observation = outcome.to_text();
                let preview = truncate_chars(&observation, self.settings.observation_max_chars);
                sink.record(TraceEvent::new(
                    run_id.as_str(),
                    TraceKind::ToolCall {
                        name: invocation.name.clone(),
                        arguments: invocation.arguments.clone(),
                        result_preview: preview.to_owned(),
                        duration_ms,
                    },
                ));
                record_step(sink, &run_id, ReactStep::Observation, preview);
                info!(
                    event_name = "tool_loop.tool_called",
                    run_id = %run_id,
                    tool = %invocation.name,
                    failed = outcome.is_failure(),
                    duration_ms,
                    "tool call recorded"
                );

                scratchpad.push_str(&format!(
                    "\nAction: {}\nAction Input: {arguments_json}\nObservation: {preview}\nThought:",
                    invocation.name
                ));
                state.record_tool_call(ToolCallRecord::new(
                    invocation.name,
                    invocation.arguments,
                    outcome,
                ));
            }
        }

        warn!(
            event_name = "tool_loop.hops_exhausted",
            run_id = %run_id,
            max_tool_hops = self.settings.max_tool_hops,
            "hop budget exhausted; synthesizing"
        );
        self.synthesize(state, sink, LoopExit::HopsExhausted, self.settings.max_tool_hops).await
    }

    /// Answers from the run's tool-call log.
    async fn synthesize(
        &self,
        state: &RunState,
        sink: &dyn TraceSink,
        exit: LoopExit,
        hops: u32,
    ) -> Result<LoopOutcome> {
        let request = CompletionRequest::new(
            vec![
                ChatMessage::system(prompts::SYNTHESIS_SYSTEM),
                ChatMessage::user(prompts::synthesis_prompt(state.query(), state.tool_calls())),
            ],
            self.settings.temperature,
        );
        let completion = self.client.complete(request).await?;
        let answer = match completion.text_or_empty() {
            "" => EMPTY_SYNTHESIS_ANSWER.to_owned(),
            text => text.to_owned(),
        };
        record_step(sink, &state.run_id().0, ReactStep::FinalAnswer, &answer);
        Ok(LoopOutcome { answer, exit, hops })
    }
}

fn record_step(sink: &dyn TraceSink, run_id: &str, step: ReactStep, content: &str) {
    sink.record(TraceEvent::new(
        run_id,
        TraceKind::ReactStep { step, content: content.to_owned() },
    ));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use concierge_core::{InMemoryTraceSink, RunState, ToolArguments, ToolOutcome, TraceKind};
    use serde_json::{json, Value};

    use super::{LoopExit, ToolLoop, ToolLoopSettings, EMPTY_SYNTHESIS_ANSWER};
    use crate::llm::{Completion, ScriptedCompletionClient, ToolInvocation};
    use crate::tools::{CalculatorTool, Tool, ToolError, ToolRegistry};

    #[derive(Clone, Default)]
    struct CountingTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &'static str {
            "create_event"
        }

        fn description(&self) -> &'static str {
            "Counts invocations"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(arguments))
        }
    }

    struct VerboseTool;

    #[async_trait]
    impl Tool for VerboseTool {
        fn name(&self) -> &'static str {
            "verbose"
        }

        fn description(&self) -> &'static str {
            "Returns a long string"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _arguments: ToolArguments) -> Result<Value, ToolError> {
            Ok(Value::String("y".repeat(2_000)))
        }
    }

    fn args(value: Value) -> ToolArguments {
        value.as_object().cloned().unwrap_or_default()
    }

    fn call(name: &str, value: Value) -> Completion {
        Completion::tool_calls(vec![ToolInvocation::new(name, args(value))])
    }

    fn tool_loop(client: &ScriptedCompletionClient, counter: &CountingTool, hops: u32) -> ToolLoop {
        let mut registry = ToolRegistry::default();
        registry.register(CalculatorTool);
        registry.register(counter.clone());
        registry.register(VerboseTool);
        ToolLoop::new(
            Arc::new(client.clone()),
            Arc::new(registry),
            ToolLoopSettings { max_tool_hops: hops, ..ToolLoopSettings::default() },
        )
    }

    #[tokio::test]
    async fn executes_tools_then_returns_the_explicit_answer() {
        let client = ScriptedCompletionClient::new([
            call("calculator", json!({"expr": "2 + 2"})),
            Completion::text("The result is 4."),
        ]);
        let sink = InMemoryTraceSink::default();
        let mut state = RunState::new("Calculate 2 + 2");

        let outcome = tool_loop(&client, &CountingTool::default(), 3)
            .run(&mut state, &sink)
            .await
            .expect("loop");

        assert_eq!(outcome.exit, LoopExit::Answered);
        assert_eq!(outcome.answer, "The result is 4.");
        assert_eq!(outcome.hops, 2);
        assert_eq!(state.tool_calls().len(), 1);
        assert_eq!(state.tool_calls()[0].result, ToolOutcome::Success(json!(4)));

        let requests = client.requests();
        assert_eq!(requests[0].tools.len(), 3);
        let second_prompt = &requests[1].messages.last().expect("user message").content;
        assert!(second_prompt.contains(
            "\nAction: calculator\nAction Input: {\"expr\":\"2 + 2\"}\nObservation: 4\nThought:"
        ));
        assert!(sink
            .events()
            .iter()
            .any(|event| matches!(&event.kind, TraceKind::ToolCall { name, .. } if name == "calculator")));
    }

    #[tokio::test]
    async fn duplicate_call_in_one_batch_is_never_executed_twice() {
        let counter = CountingTool::default();
        let invocation =
            ToolInvocation::new("create_event", args(json!({"title": "Sync", "start_time": "2025-11-05T10:00"})));
        let client = ScriptedCompletionClient::new([
            Completion::tool_calls(vec![invocation.clone(), invocation]),
            Completion::text("Created the Sync event once."),
        ]);
        let mut state = RunState::new("Book Sync twice");

        let outcome = tool_loop(&client, &counter, 3)
            .run(&mut state, &InMemoryTraceSink::default())
            .await
            .expect("loop");

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.tool_calls().len(), 1);
        assert_eq!(outcome.exit, LoopExit::DuplicateCall { name: "create_event".to_owned() });
        assert_eq!(outcome.answer, "Created the Sync event once.");
        assert!(client.requests()[1].messages[1].content.contains("1. create_event("));
    }

    #[tokio::test]
    async fn hop_budget_bounds_fresh_calls_and_synthesizes() {
        let counter = CountingTool::default();
        let client = ScriptedCompletionClient::new([
            call("create_event", json!({"n": 1})),
            call("create_event", json!({"n": 2})),
            call("create_event", json!({"n": 3})),
            call("create_event", json!({"n": 4})),
        ]);
        let mut state = RunState::new("keep going");

        let outcome = tool_loop(&client, &counter, 3)
            .run(&mut state, &InMemoryTraceSink::default())
            .await
            .expect("loop");

        assert_eq!(outcome.exit, LoopExit::HopsExhausted);
        assert_eq!(outcome.hops, 3);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.requests().len(), 4);
        assert!(client.requests()[3].tools.is_empty());
    }

    #[tokio::test]
    async fn tool_failures_are_recorded_and_the_loop_continues() {
        let client = ScriptedCompletionClient::new([
            Completion::tool_calls(vec![
                ToolInvocation::new("teleport", ToolArguments::new()),
                ToolInvocation::new("calculator", args(json!({"expr": "1 / 0"}))),
            ]),
            Completion::text("Neither worked."),
        ]);
        let mut state = RunState::new("do impossible things");

        let outcome = tool_loop(&client, &CountingTool::default(), 3)
            .run(&mut state, &InMemoryTraceSink::default())
            .await
            .expect("loop");

        assert_eq!(outcome.answer, "Neither worked.");
        let results: Vec<String> = state.tool_calls().iter().map(|call| call.result.to_text()).collect();
        assert_eq!(
            results,
            vec![
                "Error: unknown tool `teleport`".to_owned(),
                "Error: Invalid expression: division by zero".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn observations_are_truncated_and_empty_synthesis_falls_back() {
        let client = ScriptedCompletionClient::new([
            call("verbose", json!({})),
            call("verbose", json!({})),
        ]);
        let mut state = RunState::new("be verbose");

        let outcome = tool_loop(&client, &CountingTool::default(), 3)
            .run(&mut state, &InMemoryTraceSink::default())
            .await
            .expect("loop");

        assert!(matches!(outcome.exit, LoopExit::DuplicateCall { .. }));
        assert_eq!(outcome.answer, EMPTY_SYNTHESIS_ANSWER);
        let requests = client.requests();
        let second_prompt = &requests[1].messages.last().expect("user").content;
        assert!(second_prompt.contains(&format!("Observation: {}\nThought:", "y".repeat(500))));
        assert!(!second_prompt.contains(&"y".repeat(501)));
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use concierge_core::trace::render_summary;
use concierge_core::{
    AppConfig, ChatMessage, InMemoryTraceSink, Node, NodeEngine, NodeEvent, RouteDecision,
    RunState, ToolArguments, ToolCallRecord, ToolOutcome, TraceEvent, TraceKind, TraceSink,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::guardrails::{check_grounding, mask_pii, GuardrailDecision, GuardrailPolicy};
use crate::llm::{CompletionClient, CompletionRequest};
use crate::openai::OpenAiClient;
use crate::prompts;
use crate::retrieval::{JsonCorpusLoader, RetrievalClient};
use crate::router::{Decider, LlmDecider};
use crate::tool_loop::{ToolLoop, ToolLoopSettings};
use crate::tools::{
    CalculatorTool, CalendarStore, ClearEventsTool, CreateEventTool, ListEventsTool,
    SearchDocumentsTool, SendChatMessageTool, SlackChatSender, ToolRegistry,
};

pub const FALLBACK_ANSWER: &str = "I'm sorry, I couldn't find an answer to that request.";

/// Name under which retrieval appears in a run's tool-call log.
pub const RETRIEVE_RECORD_NAME: &str = "retrieve";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RuntimeSettings {
    pub top_k: usize,
    pub max_node_iterations: u32,
    pub temperature: f32,
    pub max_tool_hops: u32,
    pub observation_max_chars: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_node_iterations: 10,
            temperature: 0.0,
            max_tool_hops: 3,
            observation_max_chars: 500,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            max_node_iterations: config.agent.max_node_iterations,
            temperature: config.agent.temperature,
            max_tool_hops: config.agent.max_tool_hops,
            observation_max_chars: config.agent.observation_max_chars,
        }
    }

    fn tool_loop(&self) -> ToolLoopSettings {
        ToolLoopSettings {
            max_tool_hops: self.max_tool_hops,
            temperature: self.temperature,
            observation_max_chars: self.observation_max_chars,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub query: String,
    /// Files the request refers to; each must sit under the sandbox root.
    pub file_paths: Vec<PathBuf>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), file_paths: Vec::new() }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_paths.push(path.into());
        self
    }
}

/// The terminal run state plus everything recorded on the way there.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub state: RunState,
    pub trace: Vec<TraceEvent>,
}

impl RunReport {
    pub fn final_answer(&self) -> &str {
        self.state.final_answer().unwrap_or_default()
    }

    pub fn trace_summary(&self) -> String {
        render_summary(&self.trace)
    }
}

pub struct AgentRuntimeBuilder {
    completion: Arc<dyn CompletionClient>,
    retrieval: Arc<RetrievalClient>,
    registry: ToolRegistry,
    guardrails: GuardrailPolicy,
    decider: Option<Arc<dyn Decider>>,
    settings: RuntimeSettings,
}

impl AgentRuntimeBuilder {
    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> AgentRuntime {
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(LlmDecider::new(
                self.completion.clone(),
                self.settings.temperature,
                self.settings.max_node_iterations,
            ))
        });
        let registry = Arc::new(self.registry);
        let tool_loop =
            ToolLoop::new(self.completion.clone(), registry.clone(), self.settings.tool_loop());
        AgentRuntime {
            completion: self.completion,
            retrieval: self.retrieval,
            registry,
            guardrails: self.guardrails,
            decider,
            tool_loop,
            settings: self.settings,
        }
    }
}

/// Drives one query at a time through guard, routing, retrieval or tools, and finalize.
///
/// Runs share no mutable state, so one runtime can serve concurrent queries.
pub struct AgentRuntime {
    completion: Arc<dyn CompletionClient>,
    retrieval: Arc<RetrievalClient>,
    registry: Arc<ToolRegistry>,
    guardrails: GuardrailPolicy,
    decider: Arc<dyn Decider>,
    tool_loop: ToolLoop,
    settings: RuntimeSettings,
}

impl AgentRuntime {
    pub fn builder(
        completion: Arc<dyn CompletionClient>,
        retrieval: Arc<RetrievalClient>,
    ) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder {
            completion,
            retrieval,
            registry: ToolRegistry::default(),
            guardrails: GuardrailPolicy::default(),
            decider: None,
            settings: RuntimeSettings::default(),
        }
    }

    /// Wires the OpenAI-compatible client, the on-disk corpus and the default tool set.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let openai = Arc::new(OpenAiClient::from_config(config)?);
        let retrieval = Arc::new(RetrievalClient::new(
            openai.clone(),
            Arc::new(JsonCorpusLoader::new(config.retrieval.index_path.clone())),
        ));
        let registry = default_registry(config, retrieval.clone())?;
        Ok(Self::builder(openai, retrieval)
            .tools(registry)
            .guardrails(GuardrailPolicy::new(config.guard.sandbox_root.clone()))
            .settings(RuntimeSettings::from_config(config))
            .build())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.settings
    }

    pub async fn run(&self, query: &str) -> Result<RunReport> {
        self.run_request(RunRequest::new(query)).await
    }

    pub async fn run_request(&self, request: RunRequest) -> Result<RunReport> {
        let sink = InMemoryTraceSink::default();
        let state = self.run_with_sink(request, &sink).await?;
        Ok(RunReport { state, trace: sink.events() })
    }

    /// Runs the node machine to completion. Policy outcomes (refusals, grounding failures, tool
    /// errors, unreadable routing replies) end in a populated answer; only collaborator failures
    /// are returned as errors.
    pub async fn run_with_sink(&self, request: RunRequest, sink: &dyn TraceSink) -> Result<RunState> {
        let mut state = RunState::new(request.query.as_str());
        let run_id = state.run_id().0.clone();
        info!(event_name = "agent.run_started", run_id = %run_id, "run started");

        let mut engine = NodeEngine::new();
        sink.record(TraceEvent::new(run_id.as_str(), TraceKind::NodeEntry { node: Node::Initialize }));
        engine.apply_with_trace(NodeEvent::Initialized, sink, &run_id)?;

        let guard_event = self.guard_node(&mut state, &request.file_paths)?;
        engine.apply_with_trace(guard_event, sink, &run_id)?;

        let mut retrieved_for: Option<String> = None;
        while engine.current() == Node::Route {
            let decision = self.route(&state, retrieved_for.as_deref()).await;
            sink.record(TraceEvent::new(run_id.as_str(), TraceKind::RouteDecided { decision }));
            engine.apply_with_trace(NodeEvent::Routed(decision), sink, &run_id)?;

            match engine.current() {
                Node::Retrieval => {
                    self.retrieval_node(&mut state).await?;
                    retrieved_for = Some(state.query().to_owned());
                    engine.apply_with_trace(NodeEvent::WorkCompleted, sink, &run_id)?;
                }
                Node::ToolLoop => {
                    let outcome = self.tool_loop.run(&mut state, sink).await?;
                    debug!(event_name = "agent.tool_loop_finished", run_id = %run_id, exit = ?outcome.exit, hops = outcome.hops, "tool loop finished");
                    state.set_answer(outcome.answer)?;
                    state.complete_iteration();
                    engine.apply_with_trace(NodeEvent::WorkCompleted, sink, &run_id)?;
                }
                _ => {}
            }
        }

        state.seal_answer(mask_pii, FALLBACK_ANSWER);
        engine.apply_with_trace(NodeEvent::Finalized, sink, &run_id)?;
        info!(
            event_name = "agent.run_completed",
            run_id = %run_id,
            iterations = state.iteration_count(),
            tool_calls = state.tool_calls().len(),
            citations = state.citations().len(),
            "run completed"
        );
        Ok(state)
    }

    fn guard_node(&self, state: &mut RunState, file_paths: &[PathBuf]) -> Result<NodeEvent> {
        let paths: Vec<&Path> = file_paths.iter().map(PathBuf::as_path).collect();
        let run_id = state.run_id().0.clone();
        match self.guardrails.apply_guards(state.query(), None, &paths) {
            GuardrailDecision::Allow { masked_query } => {
                state.replace_query(masked_query);
                Ok(NodeEvent::GuardPassed)
            }
            GuardrailDecision::Refuse { category, user_message } => {
                warn!(event_name = "guard.refused", run_id = %run_id, category = category.as_str(), "query refused");
                let masked = mask_pii(state.query());
                state.replace_query(masked);
                state.set_answer(user_message)?;
                Ok(NodeEvent::GuardRefused)
            }
            GuardrailDecision::Deny { violation, masked_query } => {
                warn!(event_name = "guard.denied", run_id = %run_id, reason = violation.reason_code(), "request denied");
                state.replace_query(masked_query);
                state.set_answer(violation.to_string())?;
                Ok(NodeEvent::GuardRefused)
            }
        }
    }

    /// The decider's choice, except that the iteration ceiling holds for any decider and a
    /// second retrieval for an unchanged query finalizes instead.
    async fn route(&self, state: &RunState, retrieved_for: Option<&str>) -> RouteDecision {
        let run_id = &state.run_id().0;
        if state.iteration_count() > self.settings.max_node_iterations {
            warn!(event_name = "agent.iteration_ceiling", run_id = %run_id, "iteration ceiling exceeded; finalizing");
            return RouteDecision::Finalize;
        }
        let decision = self.decider.decide(state).await;
        if decision == RouteDecision::Retrieval && retrieved_for == Some(state.query()) {
            warn!(event_name = "agent.repeated_retrieval", run_id = %run_id, "retrieval already ran for this query; finalizing");
            return RouteDecision::Finalize;
        }
        decision
    }

    async fn retrieval_node(&self, state: &mut RunState) -> Result<()> {
        let query = state.query().to_owned();
        let run_id = state.run_id().0.clone();
        let chunks = self
            .retrieval
            .retrieve(&query, self.settings.top_k)
            .await
            .context("document retrieval failed")?;
        debug!(event_name = "agent.retrieved", run_id = %run_id, chunks = chunks.len(), "retrieved chunks");
        state.set_retrieval(chunks);

        match check_grounding(&query, state.retrieved_chunks()) {
            Err(violation) => {
                warn!(event_name = "guard.ungrounded", run_id = %run_id, "no documents to ground the answer");
                state.clear_citations();
                state.set_answer(violation.to_string())?;
            }
            Ok(()) => {
                let request = CompletionRequest::new(
                    vec![
                        ChatMessage::system(prompts::GROUNDED_ANSWER_SYSTEM),
                        ChatMessage::user(prompts::grounded_answer_prompt(
                            &query,
                            state.retrieved_chunks(),
                        )),
                    ],
                    self.settings.temperature,
                );
                let answer = self.completion.complete(request).await?.text_or_empty().to_owned();
                state.set_answer(answer.clone())?;
                state.cite_retrieved_sources();

                let mut arguments = ToolArguments::new();
                arguments.insert("query".to_owned(), json!(query));
                arguments.insert("k".to_owned(), json!(self.settings.top_k));
                state.record_tool_call(ToolCallRecord::new(
                    RETRIEVE_RECORD_NAME,
                    arguments,
                    ToolOutcome::Success(Value::String(answer)),
                ));
            }
        }

        state.complete_iteration();
        Ok(())
    }
}

/// Calculator, calendar and document search, plus chat messaging when a chat token is set.
pub fn default_registry(config: &AppConfig, retrieval: Arc<RetrievalClient>) -> Result<ToolRegistry> {
    let calendar = Arc::new(CalendarStore::new(config.tools.calendar_path.clone()));
    let mut registry = ToolRegistry::default();
    registry.register(CalculatorTool);
    registry.register(ListEventsTool::new(calendar.clone()));
    registry.register(CreateEventTool::new(calendar.clone()));
    registry.register(ClearEventsTool::new(calendar));
    registry.register(SearchDocumentsTool::new(retrieval));
    if let Some(sender) = SlackChatSender::from_config(config).context("building chat sender")? {
        registry.register(SendChatMessageTool::new(
            Arc::new(sender),
            config.tools.chat_default_channel.clone(),
        ));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use concierge_core::{AppConfig, Chunk, RouteDecision, RunState};

    use super::{default_registry, AgentRuntime, RuntimeSettings, FALLBACK_ANSWER};
    use crate::llm::{Completion, ScriptedCompletionClient};
    use crate::retrieval::{Corpus, CorpusLoader, Embedder, FlatIndex, RetrievalClient};
    use crate::router::Decider;

    struct ConstantEmbedder;

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    struct SingleChunkLoader;

    #[async_trait]
    impl CorpusLoader for SingleChunkLoader {
        async fn load(&self) -> Result<Corpus> {
            let mut index = FlatIndex::new(1);
            index.add(vec![1.0])?;
            Ok(Corpus {
                chunks: vec![Chunk::new("Overtime is paid at 1.5x the base rate.", "overtime.md")],
                index: Arc::new(index),
            })
        }
    }

    struct AlwaysRetrieve;

    #[async_trait]
    impl Decider for AlwaysRetrieve {
        async fn decide(&self, _state: &RunState) -> RouteDecision {
            RouteDecision::Retrieval
        }
    }

    fn retrieval() -> Arc<RetrievalClient> {
        Arc::new(RetrievalClient::new(Arc::new(ConstantEmbedder), Arc::new(SingleChunkLoader)))
    }

    #[tokio::test]
    async fn repeated_retrieval_for_the_same_query_finalizes() {
        let client = ScriptedCompletionClient::new([Completion::text(
            "Overtime is 1.5x [Source: overtime.md]",
        )]);
        let runtime = AgentRuntime::builder(Arc::new(client.clone()), retrieval())
            .decider(Arc::new(AlwaysRetrieve))
            .build();

        let report = runtime.run("What is the overtime rate?").await.expect("run");
        assert_eq!(report.state.iteration_count(), 1);
        assert_eq!(report.final_answer(), "Overtime is 1.5x [Source: overtime.md]");
        assert_eq!(client.requests().len(), 1);
        assert!(report.trace_summary().contains("ROUTE: finalize"));
    }

    #[tokio::test]
    async fn immediate_finalize_uses_the_fallback_answer() {
        let client = ScriptedCompletionClient::new([Completion::text("finalize")]);
        let runtime = AgentRuntime::builder(Arc::new(client), retrieval()).build();

        let report = runtime.run("hello there").await.expect("run");
        assert_eq!(report.final_answer(), FALLBACK_ANSWER);
        assert_eq!(report.state.iteration_count(), 0);
        assert_eq!(report.state.messages().len(), 1);
    }

    #[test]
    fn settings_and_registry_follow_config() {
        let mut config = AppConfig::default();
        config.agent.max_tool_hops = 7;
        assert_eq!(RuntimeSettings::from_config(&config).max_tool_hops, 7);

        let registry = default_registry(&config, retrieval()).expect("registry");
        assert_eq!(
            registry.names(),
            vec!["calculator", "clear_events", "create_event", "list_events", "search_documents"]
        );

        config.tools.chat_token = Some("xoxb-test".to_owned().into());
        let registry = default_registry(&config, retrieval()).expect("registry");
        assert!(registry.contains("send_chat_message"));
    }
}

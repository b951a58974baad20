use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::{ChatMessage, RouteDecision, RunState};
use tracing::{info, warn};

use crate::llm::{CompletionClient, CompletionRequest};
use crate::prompts;

/// Chooses the next branch for a run. Implementations never fail: anything they cannot decide
/// resolves to [`RouteDecision::Finalize`].
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, state: &RunState) -> RouteDecision;
}

pub struct LlmDecider {
    client: Arc<dyn CompletionClient>,
    temperature: f32,
    max_node_iterations: u32,
}

impl LlmDecider {
    pub fn new(client: Arc<dyn CompletionClient>, temperature: f32, max_node_iterations: u32) -> Self {
        Self { client, temperature, max_node_iterations }
    }
}

#[async_trait]
impl Decider for LlmDecider {
    async fn decide(&self, state: &RunState) -> RouteDecision {
        let run_id = &state.run_id().0;
        if state.iteration_count() > self.max_node_iterations {
            warn!(
                event_name = "router.iteration_ceiling",
                run_id = %run_id,
                iteration_count = state.iteration_count(),
                max_node_iterations = self.max_node_iterations,
                "iteration ceiling exceeded; finalizing"
            );
            return RouteDecision::Finalize;
        }

        let request = CompletionRequest::new(
            vec![
                ChatMessage::system(prompts::router_system_prompt(state)),
                ChatMessage::user(prompts::router_user_prompt(state.query())),
            ],
            self.temperature,
        );
        let reply = match self.client.complete(request).await {
            Ok(completion) => completion,
            Err(error) => {
                warn!(event_name = "router.completion_failed", run_id = %run_id, error = %error, "routing call failed; finalizing");
                return RouteDecision::Finalize;
            }
        };

        match RouteDecision::parse_token(reply.text_or_empty()) {
            Some(decision) => {
                info!(event_name = "router.decided", run_id = %run_id, decision = decision.as_token(), "router decision");
                decision
            }
            None => {
                warn!(event_name = "router.invalid_decision", run_id = %run_id, reply = reply.text_or_empty(), "invalid routing decision; finalizing");
                RouteDecision::Finalize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use concierge_core::{RouteDecision, RunState, Role};

    use super::{Decider, LlmDecider};
    use crate::llm::{Completion, ScriptedCompletionClient};

    #[tokio::test]
    async fn parses_tokens_leniently_and_fails_safe() {
        let client = ScriptedCompletionClient::new([
            Completion::text(" RAG\n"),
            Completion::text("'tool'"),
            Completion::text("I think we should retrieve"),
            Completion::default(),
        ]);
        let decider = LlmDecider::new(Arc::new(client.clone()), 0.0, 10);
        let state = RunState::new("What is the relocation allowance?");

        assert_eq!(decider.decide(&state).await, RouteDecision::Retrieval);
        assert_eq!(decider.decide(&state).await, RouteDecision::Tool);
        assert_eq!(decider.decide(&state).await, RouteDecision::Finalize);
        assert_eq!(decider.decide(&state).await, RouteDecision::Finalize);

        let request = &client.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].content, "User query: What is the relocation allowance?");
        assert!(request.tools.is_empty());
    }

    #[tokio::test]
    async fn completion_errors_finalize() {
        let client = ScriptedCompletionClient::default();
        client.push_failure("connection reset");
        let decider = LlmDecider::new(Arc::new(client), 0.0, 10);
        assert_eq!(decider.decide(&RunState::new("hi")).await, RouteDecision::Finalize);
    }

    #[tokio::test]
    async fn ceiling_finalizes_without_calling_the_service() {
        let client = ScriptedCompletionClient::new([Completion::text("rag")]);
        let decider = LlmDecider::new(Arc::new(client.clone()), 0.0, 1);
        let mut state = RunState::new("loop forever");
        state.complete_iteration();
        state.complete_iteration();

        assert_eq!(decider.decide(&state).await, RouteDecision::Finalize);
        assert!(client.requests().is_empty());
    }
}

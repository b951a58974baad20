use thiserror::Error;

use crate::flows::states::{Node, NodeEvent, RouteDecision, Transition};
use crate::trace::{TraceEvent, TraceKind, TraceSink};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {node:?} using event {event:?}")]
    InvalidTransition { node: Node, event: NodeEvent },
}

/// The fixed node topology of a run. Retrieval and the tool loop always hand back to the router.
pub fn transition(current: Node, event: NodeEvent) -> Result<Node, FlowTransitionError> {
    use NodeEvent::{Finalized, GuardPassed, GuardRefused, Initialized, Routed, WorkCompleted};

    let next = match (current, event) {
        (Node::Initialize, Initialized) => Node::Guard,
        (Node::Guard, GuardPassed) => Node::Route,
        (Node::Guard, GuardRefused) => Node::Finalize,
        (Node::Route, Routed(RouteDecision::Retrieval)) => Node::Retrieval,
        (Node::Route, Routed(RouteDecision::Tool)) => Node::ToolLoop,
        (Node::Route, Routed(RouteDecision::Finalize)) => Node::Finalize,
        (Node::Retrieval, WorkCompleted) | (Node::ToolLoop, WorkCompleted) => Node::Route,
        (Node::Finalize, Finalized) => Node::Done,
        _ => return Err(FlowTransitionError::InvalidTransition { node: current, event }),
    };
    Ok(next)
}

/// Tracks the current node of one run and records every applied transition.
#[derive(Debug)]
pub struct NodeEngine {
    current: Node,
    history: Vec<Transition>,
}

impl Default for NodeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeEngine {
    pub fn new() -> Self {
        Self { current: Node::Initialize, history: Vec::new() }
    }

    pub fn current(&self) -> Node {
        self.current
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn apply(&mut self, event: NodeEvent) -> Result<Transition, FlowTransitionError> {
        let to = transition(self.current, event)?;
        let applied = Transition { from: self.current, to, event };
        self.current = to;
        self.history.push(applied);
        Ok(applied)
    }

    /// Same as [`NodeEngine::apply`], with node exit and entry recorded on `sink`.
    pub fn apply_with_trace(
        &mut self,
        event: NodeEvent,
        sink: &dyn TraceSink,
        run_id: &str,
    ) -> Result<Transition, FlowTransitionError> {
        let from = self.current;
        let applied = self.apply(event)?;
        sink.record(TraceEvent::new(run_id, TraceKind::NodeExit { node: from }));
        if !applied.to.is_terminal() {
            sink.record(TraceEvent::new(run_id, TraceKind::NodeEntry { node: applied.to }));
        }
        Ok(applied)
    }
}

pub mod engine;
pub mod states;

pub use engine::{transition, FlowTransitionError, NodeEngine};
pub use states::{Node, NodeEvent, RouteDecision, Transition};

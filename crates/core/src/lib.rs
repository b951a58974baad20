pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod trace;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::chunk::Chunk;
pub use domain::run::{ChatMessage, Role, RunId, RunState};
pub use domain::tool_call::{ToolArguments, ToolCallRecord, ToolOutcome};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{transition, FlowTransitionError, Node, NodeEngine, NodeEvent, RouteDecision};
pub use trace::{InMemoryTraceSink, NoopTraceSink, ReactStep, TraceEvent, TraceKind, TraceSink};

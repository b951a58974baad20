//! Agent Runtime - policy-enforced question answering over documents and tools
//!
//! This crate provides the orchestration engine of the concierge system:
//! - Screens every query against the guard policy (refusals, PII, sandboxed paths)
//! - Routes each step to document retrieval, the tool loop, or finalization
//! - Runs a bounded ReAct tool loop with duplicate-call detection
//! - Masks PII in every answer it hands back
//!
//! # Architecture
//!
//! A run walks the node table from `concierge_core::flows`:
//! 1. **Guard** (`guardrails`) - refuse, deny or pass a masked query
//! 2. **Route** (`router`) - a `Decider` picks `rag`, `tool` or `finalize`
//! 3. **Retrieval** (`retrieval`) - top-k chunks, grounding check, cited answer
//! 4. **Tool Loop** (`tool_loop`) - Thought/Action/Observation over the `tools` registry
//! 5. **Finalize** (`runtime`) - mask and seal the answer
//!
//! # Key Types
//!
//! - `AgentRuntime` - Main orchestrator (see `runtime` module)
//! - `CompletionClient` - Pluggable completion service (see `llm`, `openai`)
//! - `GuardrailPolicy` - Refusal, masking, grounding and sandbox checks
//!
//! # Safety Principle
//!
//! The completion service only ever chooses among fixed options. Anything it returns that
//! the runtime cannot interpret ends the run through Finalize, never in a retry loop.

pub mod guardrails;
pub mod llm;
pub mod openai;
pub mod prompts;
pub mod retrieval;
pub mod router;
pub mod runtime;
pub mod tool_loop;
pub mod tools;

pub use guardrails::{GuardrailDecision, GuardrailPolicy, RefusalCategory};
pub use llm::{Completion, CompletionClient, CompletionRequest, ScriptedCompletionClient};
pub use retrieval::RetrievalClient;
pub use router::{Decider, LlmDecider};
pub use runtime::{AgentRuntime, RunReport, RunRequest, RuntimeSettings};
pub use tool_loop::{LoopExit, ToolLoop};
pub use tools::{Tool, ToolError, ToolRegistry};

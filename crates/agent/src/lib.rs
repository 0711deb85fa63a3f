//! Agent runtime for the marketplace companion
//!
//! This crate is the conversational layer between a shopper and the catalog:
//! - Resolves which persona speaks for a user
//! - Assembles the per-turn context from stored history and the current page
//! - Runs the bounded tool-calling loop against the text backend
//! - Labels recommendation candidates with persona-voiced reasons
//!
//! # Architecture
//!
//! One chat exchange flows through:
//! 1. **Persona Resolution** (`persona`) - forced, equipped, first owned, default, builtin
//! 2. **Context Assembly** (`context`) - system prompt, history window, guidance, page text
//! 3. **Orchestration** (`orchestrator`) - backend call, tool execution, repeat up to the cap
//! 4. **Tool Execution** (`tools`) - closed set of marketplace operations behind `guardrails`
//! 5. **Persistence** (`runtime`) - one terminal append of the whole exchange
//!
//! # Key Types
//!
//! - `AgentRuntime` - Facade used by the server and CLI (see `runtime` module)
//! - `LlmBackend` - Pluggable trait for OpenAI-compatible endpoints
//! - `ToolCall` - Every operation the model may request
//!
//! # Safety Principle
//!
//! The model never mutates state directly. Balances, ownership and listings only
//! change through repository calls made by the tool executor.

pub mod context;
pub mod errors;
pub mod guardrails;
pub mod llm;
pub mod openai;
pub mod orchestrator;
pub mod page_context;
pub mod persona;
pub mod rationale;
pub mod runtime;
pub mod tools;

pub use errors::{AgentError, BackendError, ToolError};
pub use llm::{ContextEntry, LlmBackend};
pub use page_context::PageContext;
pub use runtime::{
    AgentRuntime, AgentSettings, ConverseReply, GuidanceReply, GuidanceRequest, RecommendMode,
    RecommendReply,
};
pub use tools::ToolCall;

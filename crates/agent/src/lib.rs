//! `runtime-agent` is the agent-facing half of the runtime: the streaming
//! tool-call parser, the dependency-DAG dispatcher, the hook pipeline,
//! conversation storage and compaction, the cost ledger, the execution
//! event tree, and the iteration loop that ties them together. It depends
//! on `runtime-core` for model identity, the provider adapter contract and
//! retry policy, but never speaks to a provider directly itself.

/// Registered callables ("gadgets") the model can invoke: spec, context,
/// control-flow-via-return-value outcomes, and the registry.
pub mod tool;

/// The hierarchical execution event tree: nodes, event kinds, allocators
/// and observers.
pub mod events;

/// The three-kind hook pipeline: observers, interceptors and controllers.
pub mod hooks;

/// The streaming gadget-call grammar parser.
pub mod parser;

/// The dependency-DAG tool-call dispatcher.
pub mod dispatcher;

/// The conversation store (protected base history plus appended turns).
pub mod conversation;

/// The agent crate's structured error type.
pub mod error;

/// Context compaction strategies (sliding window, summarization, hybrid).
pub mod compaction;

/// The per-run cost/usage ledger.
pub mod ledger;

/// The iteration driver tying the above together into a run.
pub mod agent_loop;

/// The subagent tool: a nested [`agent_loop::AgentLoop`] run exposed as an
/// ordinary [`tool::Tool`].
pub mod subagent;

pub use agent_loop::{
    AgentLoop, AgentLoopConfig, AgentLoopConfigBuilder, AgentRunOutcome, HumanInputChannel,
    TerminationReason, TextOnlyHandler,
};
pub use error::AgentError;
pub use events::{Event, EventKind, EventObserver, ExecutionNode, NodeId, NodeKind};
pub use tool::{Tool, ToolContext, ToolOutcome, ToolRegistry, ToolSpec};

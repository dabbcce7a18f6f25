//! Tools ("gadgets", C5): schema-typed callables the model invokes.

use crate::events::{EventAllocator, EventObserver, ExecutionNode, NodeAllocator};
use async_trait::async_trait;
use runtime_core::schema::ParamSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Registered, immutable description of a callable tool (§3's ToolSpec
/// entity).
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameter_schema: ParamSchema,
    pub examples: Vec<String>,
    pub timeout: Duration,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: ParamSchema) -> Self {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            parameter_schema: schema,
            examples: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }
}

/// What calling context a tool's `execute` runs inside: the invocation's
/// id, the run-wide cancellation token, and this call's own node in the
/// execution tree plus the shared allocators/sink needed to extend it —
/// the subagent tool (C14) is the only tool that uses the latter, to run
/// a nested loop whose events appear as deeper nodes in the same tree.
#[derive(Clone)]
pub struct ToolContext {
    pub invocation_id: String,
    pub cancellation: tokio_util::sync::CancellationToken,
    pub node: ExecutionNode,
    pub node_allocator: Arc<NodeAllocator>,
    pub event_allocator: Arc<EventAllocator>,
    pub event_sink: Arc<dyn EventObserver>,
}

/// Monetary cost a tool reports for its own execution (distinct from token
/// cost, which the ledger derives from model pricing). Folded into the
/// cost ledger (C13) alongside token cost.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ToolCost {
    pub usd: f64,
}

/// What a tool's `execute` produced on success.
#[derive(Debug, Clone)]
pub struct ToolSuccess {
    pub result: String,
    pub media: Option<Value>,
    pub cost: Option<ToolCost>,
}

impl ToolSuccess {
    pub fn text(result: impl Into<String>) -> Self {
        ToolSuccess {
            result: result.into(),
            media: None,
            cost: None,
        }
    }
}

/// Control-flow-via-return-value sum type replacing the `TaskCompletion` /
/// `HumanInputRequired` exception sentinels named in §9 DESIGN NOTES: "model
/// as explicit return values from `Execute`... do not use exceptions for
/// control flow."
pub enum ToolOutcome {
    /// Ordinary successful execution.
    Done(ToolSuccess),
    /// Signals the agent loop to terminate with this summary.
    Complete(String),
    /// Signals the loop to suspend and ask the caller a question; the
    /// caller's eventual string answer becomes this tool's result.
    NeedInput(String),
}

/// Errors a tool's `execute` can fail with. Recorded as a synthetic tool
/// result by the dispatcher rather than aborting the loop, unless the
/// loop's `stop_on_gadget_error` is set (§4.6 Failure semantics).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("{0}")]
    Failed(String),
}

/// A callable tool (C5). `execute` validates nothing itself — the
/// dispatcher validates `params` against [`ToolSpec::parameter_schema`]
/// before calling `execute` at all (§4.4).
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutcome, ToolError>;
}

/// Registry of tools available to one agent loop instance, keyed by name.
/// Built at agent construction and immutable thereafter (§3).
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.spec().name.clone(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec().clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

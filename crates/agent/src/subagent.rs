//! Subagent tool (C14): a [`Tool`] whose `execute` recursively runs a
//! nested [`AgentLoop`], bounded by a depth limit and nested under the
//! calling tool's own node in the event tree (§4.11: "Subagent events are
//! not specially wrapped; their `depth > 0` distinguishes them").

use crate::agent_loop::AgentLoop;
use crate::events::{ExecutionNode, NodeKind};
use crate::tool::{Tool, ToolContext, ToolError, ToolOutcome, ToolSpec, ToolSuccess};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Mints the execution node a nested subagent run should use as its own
/// root: a `subagent`-kind child of the calling tool's node, sharing the
/// parent run's allocators so ids stay unique across the whole tree.
pub fn subagent_root_node(ctx: &ToolContext) -> ExecutionNode {
    ctx.node_allocator.child(&ctx.node, NodeKind::Subagent, now_ms())
}

/// Builds the nested [`AgentLoop`] one [`SubagentTool`] invocation runs.
/// Implementations close over whatever provider, model, registry and hook
/// pipeline the subagent should use — typically the parent's own, or a
/// narrowed copy — and call [`AgentLoop::new_nested`] with
/// [`subagent_root_node`] and `ctx`'s shared allocators so the nested run's
/// events land as deeper nodes in the same tree.
#[async_trait]
pub trait SubagentFactory: Send + Sync {
    async fn build(&self, ctx: &ToolContext, task: &str) -> Result<AgentLoop, ToolError>;
}

/// A tool that recursively invokes C11 (§4.10's "Subagents" redesign flag).
/// Depth is enforced against `ctx.node.depth`, which already reflects every
/// ancestor subagent invocation, not the nested loop's own iteration count.
pub struct SubagentTool {
    spec: ToolSpec,
    factory: Arc<dyn SubagentFactory>,
    depth_limit: u32,
}

impl SubagentTool {
    pub fn new(spec: ToolSpec, factory: Arc<dyn SubagentFactory>, depth_limit: u32) -> Self {
        SubagentTool { spec, factory, depth_limit }
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutcome, ToolError> {
        if ctx.node.depth >= self.depth_limit {
            return Err(ToolError::Failed(format!(
                "subagent depth limit ({}) reached at depth {}",
                self.depth_limit, ctx.node.depth
            )));
        }

        let task = params
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParameters("missing `task` string parameter".into()))?;

        let nested = self.factory.build(ctx, task).await?;
        let outcome = nested
            .run(ctx.event_sink.clone(), ctx.cancellation.clone())
            .await
            .map_err(|err| ToolError::Failed(err.to_string()))?;

        Ok(ToolOutcome::Done(ToolSuccess::text(outcome.final_text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_loop::AgentLoopConfig;
    use crate::compaction::{Compactor, Strategy};
    use crate::conversation::ConversationStore;
    use crate::events::{ChannelObserver, EventAllocator, NodeAllocator};
    use crate::hooks::HookPipeline;
    use crate::tool::ToolRegistry;
    use runtime_core::chat::ChatMessage;
    use runtime_core::model::{ModelDescriptor, ModelId};
    use runtime_core::provider::mock::{arc_mock, text_only_script};
    use runtime_core::schema::ParamSchema;
    use tokio_util::sync::CancellationToken;

    struct EchoFactory;

    #[async_trait]
    impl SubagentFactory for EchoFactory {
        async fn build(&self, ctx: &ToolContext, task: &str) -> Result<AgentLoop, ToolError> {
            let provider = arc_mock(vec![text_only_script(&format!("done: {task}"))]);
            let conversation = ConversationStore::new(
                vec![ChatMessage::system("you are a focused subagent")],
                vec![ChatMessage::user(task)],
            );
            let descriptor = ModelDescriptor {
                known: true,
                context_window: Some(20_000),
                max_output_tokens: Some(2_048),
                ..Default::default()
            };
            Ok(AgentLoop::new_nested(
                conversation,
                provider,
                ModelId::parse("mock:sub").unwrap(),
                descriptor,
                ToolRegistry::new(),
                HookPipeline::new(),
                Compactor::new(Default::default(), Strategy::SlidingWindow),
                None,
                runtime_core::retry::RetryPolicy::default(),
                AgentLoopConfig::default(),
                None,
                subagent_root_node(ctx),
                ctx.node_allocator.clone(),
                ctx.event_allocator.clone(),
            ))
        }
    }

    fn context(node: ExecutionNode, node_allocator: Arc<NodeAllocator>) -> ToolContext {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        ToolContext {
            invocation_id: "call-1".into(),
            cancellation: CancellationToken::new(),
            node,
            node_allocator,
            event_allocator: Arc::new(EventAllocator::new()),
            event_sink: Arc::new(ChannelObserver::new(tx)),
        }
    }

    fn spec() -> ToolSpec {
        ToolSpec::new(
            "Delegate",
            "delegates a task to a subagent",
            ParamSchema::String { description: "task".into() },
        )
    }

    #[tokio::test]
    async fn nested_run_returns_its_final_text_as_the_tool_result() {
        let node_allocator = Arc::new(NodeAllocator::new());
        let root = node_allocator.root(NodeKind::ToolCall, 0);
        let ctx = context(root, node_allocator);
        let tool = SubagentTool::new(spec(), Arc::new(EchoFactory), 4);

        let outcome = tool
            .execute(&ctx, serde_json::json!({ "task": "summarize the repo" }))
            .await
            .unwrap();
        match outcome {
            ToolOutcome::Done(success) => {
                assert_eq!(success.result, "done: summarize the repo");
            }
            _ => panic!("expected Done"),
        }
    }

    #[tokio::test]
    async fn depth_at_limit_is_rejected_before_building_the_nested_loop() {
        let node_allocator = Arc::new(NodeAllocator::new());
        let mut root = node_allocator.root(NodeKind::ToolCall, 0);
        root.depth = 4;
        let ctx = context(root, node_allocator);
        let tool = SubagentTool::new(spec(), Arc::new(EchoFactory), 4);

        let err = tool
            .execute(&ctx, serde_json::json!({ "task": "anything" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed(msg) if msg.contains("depth limit")));
    }

    #[tokio::test]
    async fn missing_task_parameter_is_an_invalid_parameters_error() {
        let node_allocator = Arc::new(NodeAllocator::new());
        let root = node_allocator.root(NodeKind::ToolCall, 0);
        let ctx = context(root, node_allocator);
        let tool = SubagentTool::new(spec(), Arc::new(EchoFactory), 4);

        let err = tool.execute(&ctx, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}

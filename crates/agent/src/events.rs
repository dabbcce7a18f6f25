//! The execution event tree (C12): every state transition the loop, the
//! dispatcher, and compaction emit is wrapped in an [`Event`] carrying
//! `eventId`, `nodeId`, `parentId`, `depth` and `path`, so a caller — or a
//! nested subagent's caller — can reconstruct the run's shape from the
//! flat stream alone.

use async_trait::async_trait;
use runtime_core::error::LLMError;
use runtime_core::Usage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one node (iteration, tool call, or subagent run) in the
/// execution tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Kind of node an [`ExecutionNode`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Iteration,
    ToolCall,
    Subagent,
}

/// A node in the execution tree. The root node is created when a run
/// begins and has `parent_id = None`, `depth = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    pub path: Vec<NodeId>,
    pub kind: NodeKind,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
}

/// Allocates monotonic node ids and builds child nodes with the correct
/// depth/path, scoped to a single run (including any subagent runs nested
/// inside it — each subagent gets its own [`NodeAllocator`] seeded from the
/// parent's next node id so ids stay process-wide unique within a run tree).
pub struct NodeAllocator {
    next: AtomicU64,
}

impl NodeAllocator {
    pub fn new() -> Self {
        NodeAllocator { next: AtomicU64::new(0) }
    }

    fn alloc(&self) -> NodeId {
        NodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn root(&self, kind: NodeKind, now_ms: i64) -> ExecutionNode {
        let id = self.alloc();
        ExecutionNode {
            id,
            parent_id: None,
            depth: 0,
            path: vec![id],
            kind,
            started_at_ms: now_ms,
            ended_at_ms: None,
        }
    }

    pub fn child(&self, parent: &ExecutionNode, kind: NodeKind, now_ms: i64) -> ExecutionNode {
        let id = self.alloc();
        let mut path = parent.path.clone();
        path.push(id);
        ExecutionNode {
            id,
            parent_id: Some(parent.id),
            depth: parent.depth + 1,
            path,
            kind,
            started_at_ms: now_ms,
            ended_at_ms: None,
        }
    }
}

impl Default for NodeAllocator {
    fn default() -> Self {
        NodeAllocator::new()
    }
}

/// The payload of one emitted [`Event`]. Names match §4.11 verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    LlmCallStart { message_count: usize },
    LlmCallStream { text: String },
    LlmResponseEnd,
    LlmCallComplete { usage: Option<Usage>, tool_call_count: usize },
    LlmCallError { message: String },
    GadgetCall { invocation_id: String, gadget_name: String, parameters_raw: String },
    GadgetStart { invocation_id: String },
    GadgetComplete { invocation_id: String, result: String },
    GadgetError { invocation_id: String, message: String },
    GadgetSkipped { invocation_id: String, reason: String },
    Text { fragment: String },
    Thinking { fragment: String },
    Compaction { tokens_before: u64, tokens_after: u64, strategy: String },
    HumanInputRequired { invocation_id: String, question: String },
    StreamComplete,
    Abort,
}

/// One emitted event: the tree-location metadata plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub timestamp_ms: i64,
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub depth: u32,
    pub path: Vec<NodeId>,
    pub kind: EventKind,
}

/// Allocates monotonic event ids and stamps events with a node's tree
/// location. Distinct from [`NodeAllocator`] since many events share one
/// node (e.g. every `llm_call_stream` chunk of one iteration).
pub struct EventAllocator {
    next: AtomicU64,
}

impl EventAllocator {
    pub fn new() -> Self {
        EventAllocator { next: AtomicU64::new(0) }
    }

    pub fn emit(&self, node: &ExecutionNode, now_ms: i64, kind: EventKind) -> Event {
        Event {
            event_id: self.next.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: now_ms,
            node_id: node.id,
            parent_id: node.parent_id,
            depth: node.depth,
            path: node.path.clone(),
            kind,
        }
    }
}

impl Default for EventAllocator {
    fn default() -> Self {
        EventAllocator::new()
    }
}

/// Sink every emitted event is published to. The loop's own lazy sequence
/// (see `crate::agent_loop`) is the primary consumer; [`EventObserver`]s
/// registered through the hook pipeline receive the same events in
/// parallel, with errors swallowed (§4.9: Observer "errors logged", never
/// propagated to the loop).
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// An [`EventObserver`] that forwards into an unbounded channel, used by
/// [`crate::agent_loop::AgentLoop::run`] to expose its lazy event sequence
/// to a single external consumer.
pub struct ChannelObserver {
    sender: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<Event>) -> Self {
        ChannelObserver { sender }
    }
}

#[async_trait]
impl EventObserver for ChannelObserver {
    async fn on_event(&self, event: &Event) {
        let _ = self.sender.send(event.clone());
    }
}

/// Fans one event out to every registered observer concurrently, swallowing
/// individual observer errors/panics-as-errors per §4.9's Observer
/// semantics ("async allowed... errors logged").
pub struct ObserverFanout {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl ObserverFanout {
    pub fn new(observers: Vec<Arc<dyn EventObserver>>) -> Self {
        ObserverFanout { observers }
    }

    pub async fn publish(&self, event: &Event) {
        let futures = self.observers.iter().map(|o| o.on_event(event));
        futures::future::join_all(futures).await;
    }
}

/// A fanout is itself an observer, so a subagent's own fanout can be handed
/// down as a single [`EventObserver`] the parent run forwards into (C14:
/// "propagate depth and parent node id through the event tree").
#[async_trait]
impl EventObserver for ObserverFanout {
    async fn on_event(&self, event: &Event) {
        self.publish(event).await;
    }
}

/// Maps a [`runtime_core::error::LLMError`] into the `llm_call_error`
/// event's message, used by the loop when retries are exhausted.
pub fn llm_error_message(err: &LLMError) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_child_nodes_track_depth_and_path() {
        let allocator = NodeAllocator::new();
        let root = allocator.root(NodeKind::Iteration, 0);
        assert_eq!(root.depth, 0);
        assert_eq!(root.path, vec![root.id]);

        let child = allocator.child(&root, NodeKind::ToolCall, 1);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.path, vec![root.id, child.id]);

        let grandchild = allocator.child(&child, NodeKind::Subagent, 2);
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.path, vec![root.id, child.id, grandchild.id]);
    }

    #[tokio::test]
    async fn observer_fanout_runs_every_observer() {
        struct Counting(std::sync::atomic::AtomicU64);
        #[async_trait]
        impl EventObserver for Counting {
            async fn on_event(&self, _event: &Event) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let counter = Arc::new(Counting(std::sync::atomic::AtomicU64::new(0)));
        let fanout = ObserverFanout::new(vec![counter.clone()]);
        let allocator = NodeAllocator::new();
        let node = allocator.root(NodeKind::Iteration, 0);
        let events = EventAllocator::new();
        let event = events.emit(&node, 0, EventKind::StreamComplete);
        fanout.publish(&event).await;
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
    }
}

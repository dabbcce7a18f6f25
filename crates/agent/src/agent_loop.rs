//! Agent loop (C11): the iteration driver that alternates LLM calls and
//! tool dispatch until a termination policy fires.

use crate::compaction::{Compactor, Summarizer};
use crate::conversation::{render_tool_record, ConversationStore};
use crate::dispatcher::{
    DispatchEventSink, DispatchStatus, Dispatcher, DispatcherConfig, EarlyExit,
};
use crate::error::AgentError;
use crate::events::{
    EventAllocator, EventKind, EventObserver, ExecutionNode, NodeAllocator, NodeKind,
};
use crate::hooks::{ControllerAction, HookPipeline};
use crate::ledger::{Ledger, LedgerConfig};
use crate::parser::{ParseEvent, ParserConfig, StreamParser};
use crate::tool::ToolRegistry;
use futures::StreamExt;
use parking_lot::Mutex;
use runtime_core::chat::ChatMessage;
use runtime_core::model::ModelDescriptor;
use runtime_core::model::ModelId;
use runtime_core::provider::{estimate_tokens, ProviderAdapter, StreamOptions};
use runtime_core::retry::RetryPolicy;
use runtime_core::Usage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// How the loop reacts to an assistant turn with zero tool calls (§4.10
/// step 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOnlyHandler {
    /// Stop the run; the assistant's text is the final answer. Default.
    Terminate,
    /// Keep going — the model may still be "thinking" across turns.
    Acknowledge,
}

impl Default for TextOnlyHandler {
    fn default() -> Self {
        TextOnlyHandler::Terminate
    }
}

/// Tunables for one [`AgentLoop`] run. Every field named in `spec.md`'s
/// §4.2/§4.6/§4.8/§6 defaults has a `Default` impl here; construct via
/// [`AgentLoopConfigBuilder`] for a fluent builder.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub max_iterations: u32,
    pub text_only_handler: TextOnlyHandler,
    pub stop_on_gadget_error: bool,
    pub max_cost_usd: Option<f64>,
    pub temperature: Option<f64>,
    pub max_output_tokens_override: Option<u64>,
    pub parser: ParserConfig,
    pub dispatcher: DispatcherConfig,
    pub ledger: LedgerConfig,
    pub subagent_depth_limit: u32,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        AgentLoopConfig {
            max_iterations: 25,
            text_only_handler: TextOnlyHandler::Terminate,
            stop_on_gadget_error: false,
            max_cost_usd: None,
            temperature: None,
            max_output_tokens_override: None,
            parser: ParserConfig::default(),
            dispatcher: DispatcherConfig::default(),
            ledger: LedgerConfig::default(),
            subagent_depth_limit: 4,
        }
    }
}

/// Fluent builder for [`AgentLoopConfig`], mirroring the teacher's
/// `AgentConfigBuilder` (`crates/agent/src/agent/agent_config_builder.rs`).
#[derive(Default)]
pub struct AgentLoopConfigBuilder {
    config: AgentLoopConfig,
}

impl AgentLoopConfigBuilder {
    pub fn new() -> Self {
        AgentLoopConfigBuilder::default()
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        self.config.max_iterations = n;
        self
    }

    pub fn text_only_handler(mut self, handler: TextOnlyHandler) -> Self {
        self.config.text_only_handler = handler;
        self
    }

    pub fn stop_on_gadget_error(mut self, stop: bool) -> Self {
        self.config.stop_on_gadget_error = stop;
        self
    }

    pub fn max_cost_usd(mut self, cap: f64) -> Self {
        self.config.max_cost_usd = Some(cap);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn parser(mut self, parser: ParserConfig) -> Self {
        self.config.parser = parser;
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.config.dispatcher = dispatcher;
        self
    }

    pub fn subagent_depth_limit(mut self, limit: u32) -> Self {
        self.config.subagent_depth_limit = limit;
        self
    }

    pub fn build(self) -> AgentLoopConfig {
        self.config
    }
}

/// Why a run stopped (§4.10 step 9's termination branches, reified).
#[derive(Debug, Clone)]
pub enum TerminationReason {
    TextOnly,
    TaskCompletion,
    MaxIterations,
    CostCap,
    GadgetError,
    Aborted,
}

/// What a completed (or aborted) run produced.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    pub final_text: String,
    pub iterations: u32,
    pub usage: Usage,
    pub cost_usd: f64,
    pub reason: TerminationReason,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Bridges the dispatcher's synchronous [`DispatchEventSink`] contract to
/// the loop's [`EventObserver`]/[`EventAllocator`]/[`NodeAllocator`] triple,
/// lazily minting one child node per invocation the first time it is seen.
struct IterationDispatchSink {
    node_allocator: Arc<NodeAllocator>,
    event_allocator: Arc<EventAllocator>,
    event_sink: Arc<dyn EventObserver>,
    parent: ExecutionNode,
    nodes: Mutex<HashMap<String, ExecutionNode>>,
}

impl IterationDispatchSink {
    fn new(
        node_allocator: Arc<NodeAllocator>,
        event_allocator: Arc<EventAllocator>,
        event_sink: Arc<dyn EventObserver>,
        parent: ExecutionNode,
    ) -> Self {
        IterationDispatchSink {
            node_allocator,
            event_allocator,
            event_sink,
            parent,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn node_for_sync(&self, invocation_id: &str) -> ExecutionNode {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(invocation_id) {
            return node.clone();
        }
        let node = self.node_allocator.child(&self.parent, NodeKind::ToolCall, now_ms());
        nodes.insert(invocation_id.to_string(), node.clone());
        node
    }
}

#[async_trait::async_trait]
impl DispatchEventSink for IterationDispatchSink {
    async fn emit(&self, invocation_id: &str, kind: EventKind) {
        let node = self.node_for_sync(invocation_id);
        let event = self.event_allocator.emit(&node, now_ms(), kind);
        self.event_sink.on_event(&event).await;
    }

    fn node_for(&self, invocation_id: &str) -> ExecutionNode {
        self.node_for_sync(invocation_id)
    }
}

/// Asks the caller a question raised by [`crate::tool::ToolOutcome::NeedInput`]
/// and suspends until it answers. No default implementation is wired in —
/// a run with no channel attached fails fast with [`AgentError::NoResumeChannel`]
/// rather than hanging (§4.4, §4.10 step 9).
#[async_trait::async_trait]
pub trait HumanInputChannel: Send + Sync {
    async fn ask(&self, invocation_id: &str, question: &str) -> Result<String, AgentError>;
}

/// The iteration driver (C11). Owns the conversation store, the event
/// emitter, and the cost ledger exclusively (§3 Ownership).
pub struct AgentLoop {
    conversation: ConversationStore,
    provider: Arc<dyn ProviderAdapter>,
    model: ModelId,
    descriptor: ModelDescriptor,
    tools: ToolRegistry,
    hooks: HookPipeline,
    compactor: Compactor,
    summarizer: Option<Arc<dyn Summarizer>>,
    retry: RetryPolicy,
    config: AgentLoopConfig,
    ledger: Ledger,
    human_input: Option<Arc<dyn HumanInputChannel>>,
    run_root: ExecutionNode,
    node_allocator: Arc<NodeAllocator>,
    event_allocator: Arc<EventAllocator>,
}

impl AgentLoop {
    /// Full constructor, used by the subagent tool (C14) to nest a run
    /// under a parent's execution tree — `run_root` is then a child of the
    /// calling tool's own node and `node_allocator`/`event_allocator` are
    /// shared with the parent run so ids stay unique across the whole tree.
    #[allow(clippy::too_many_arguments)]
    pub fn new_nested(
        conversation: ConversationStore,
        provider: Arc<dyn ProviderAdapter>,
        model: ModelId,
        descriptor: ModelDescriptor,
        tools: ToolRegistry,
        hooks: HookPipeline,
        compactor: Compactor,
        summarizer: Option<Arc<dyn Summarizer>>,
        retry: RetryPolicy,
        config: AgentLoopConfig,
        human_input: Option<Arc<dyn HumanInputChannel>>,
        run_root: ExecutionNode,
        node_allocator: Arc<NodeAllocator>,
        event_allocator: Arc<EventAllocator>,
    ) -> Self {
        let ledger_config = config.ledger;
        AgentLoop {
            conversation,
            provider,
            model,
            descriptor,
            tools,
            hooks,
            compactor,
            summarizer,
            retry,
            config,
            ledger: Ledger::new(ledger_config),
            human_input,
            run_root,
            node_allocator,
            event_allocator,
        }
    }

    /// Convenience constructor for a top-level run: mints a fresh node
    /// allocator and a depth-0 root node.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversation: ConversationStore,
        provider: Arc<dyn ProviderAdapter>,
        model: ModelId,
        descriptor: ModelDescriptor,
        tools: ToolRegistry,
        hooks: HookPipeline,
        compactor: Compactor,
        summarizer: Option<Arc<dyn Summarizer>>,
        retry: RetryPolicy,
        config: AgentLoopConfig,
        human_input: Option<Arc<dyn HumanInputChannel>>,
    ) -> Self {
        let node_allocator = Arc::new(NodeAllocator::new());
        let run_root = node_allocator.root(NodeKind::Iteration, now_ms());
        AgentLoop::new_nested(
            conversation,
            provider,
            model,
            descriptor,
            tools,
            hooks,
            compactor,
            summarizer,
            retry,
            config,
            human_input,
            run_root,
            node_allocator,
            Arc::new(EventAllocator::new()),
        )
    }

    /// Runs the loop to completion (or to its first unrescued error),
    /// publishing every event to `observer` as it happens — the "lazy
    /// sequence" of §4.10 is the caller's own channel fed by this observer;
    /// a [`crate::events::ChannelObserver`] turns that into an
    /// `UnboundedReceiver<Event>` a single consumer drains.
    #[instrument(name = "agent.run", skip(self, observer, cancellation))]
    pub async fn run(
        mut self,
        observer: Arc<dyn EventObserver>,
        cancellation: CancellationToken,
    ) -> Result<AgentRunOutcome, AgentError> {
        let mut iteration: u32 = 0;
        let mut last_assistant_text = String::new();

        loop {
            if cancellation.is_cancelled() {
                self.publish(&observer, EventKind::Abort).await;
                self.hooks.notify_observers("onAbort", &serde_json::json!({ "iteration": iteration }).to_string()).await;
                return Ok(AgentRunOutcome {
                    final_text: last_assistant_text,
                    iterations: iteration,
                    usage: self.ledger.usage(),
                    cost_usd: self.ledger.total_cost_usd(),
                    reason: TerminationReason::Aborted,
                });
            }

            let iteration_node =
                self.node_allocator.child(&self.run_root, NodeKind::Iteration, now_ms());

            self.maybe_compact(&observer, &iteration_node).await?;

            self.hooks
                .notify_observers("onLLMCallStart", &serde_json::json!({ "iteration": iteration }).to_string())
                .await;

            let before = self
                .hooks
                .run_controllers(
                    "beforeLLMCall",
                    &serde_json::json!({ "iteration": iteration }),
                )
                .await?;

            let (assistant_text, tool_calls, usage) = match before {
                ControllerAction::Skip { value } => (value, Vec::new(), None),
                _ => {
                    self.publish(
                        &observer,
                        EventKind::LlmCallStart {
                            message_count: self.conversation.messages().len(),
                        },
                    )
                    .await;
                    self.hooks
                        .notify_observers(
                            "onLLMCallReady",
                            &serde_json::json!({ "iteration": iteration, "messageCount": self.conversation.messages().len() }).to_string(),
                        )
                        .await;
                    self.run_llm_call(&observer, &iteration_node, cancellation.clone())
                        .await?
                }
            };

            if let Some(usage) = &usage {
                self.ledger.record_usage(usage, &self.descriptor.pricing);
            }

            let after = self
                .hooks
                .run_controllers(
                    "afterLLMCall",
                    &serde_json::json!({ "text": assistant_text, "toolCallCount": tool_calls.len() }),
                )
                .await?;

            let (final_text, trailing_messages) = match after {
                ControllerAction::ModifyAndContinue { text } => (text, Vec::new()),
                ControllerAction::AppendMessages { messages } => (assistant_text, messages),
                ControllerAction::AppendAndModify { messages, text } => (text, messages),
                _ => (assistant_text, Vec::new()),
            };

            let final_text = self
                .hooks
                .run_interceptors("interceptAssistantMessage", serde_json::Value::String(final_text.clone()))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or(final_text);

            // §9 Open Questions: the assistant message is written to
            // history before any trailing messages `afterLLMCall` appends.
            self.conversation.append(ChatMessage::assistant(final_text.clone()));
            self.conversation.append_all(trailing_messages);
            last_assistant_text = final_text;

            self.publish(
                &observer,
                EventKind::LlmCallComplete { usage: usage.clone(), tool_call_count: tool_calls.len() },
            )
            .await;
            self.hooks
                .notify_observers(
                    "onLLMCallComplete",
                    &serde_json::json!({ "iteration": iteration, "usage": usage, "toolCallCount": tool_calls.len() }).to_string(),
                )
                .await;

            if tool_calls.is_empty() {
                if self.config.text_only_handler == TextOnlyHandler::Terminate {
                    return Ok(self.finish(iteration + 1, last_assistant_text, TerminationReason::TextOnly));
                }
            } else {
                let dispatch_sink = IterationDispatchSink::new(
                    self.node_allocator.clone(),
                    self.event_allocator.clone(),
                    observer.clone(),
                    iteration_node.clone(),
                );
                let dispatcher = Dispatcher::new(
                    self.tools.clone(),
                    self.hooks.clone(),
                    self.config.dispatcher.clone(),
                    self.node_allocator.clone(),
                    self.event_allocator.clone(),
                    observer.clone(),
                );
                let report = dispatcher
                    .dispatch(tool_calls.clone(), cancellation.clone(), &dispatch_sink)
                    .await?;

                let mut results_by_id: HashMap<String, DispatchStatus> = report
                    .results
                    .iter()
                    .map(|r| (r.invocation_id.clone(), r.status.clone()))
                    .collect();

                let mut had_error = false;
                if let Some(EarlyExit::HumanInputRequired { invocation_id, question }) =
                    &report.early_exit
                {
                    let Some(channel) = &self.human_input else {
                        return Err(AgentError::NoResumeChannel);
                    };
                    self.publish(
                        &observer,
                        EventKind::HumanInputRequired {
                            invocation_id: invocation_id.clone(),
                            question: question.clone(),
                        },
                    )
                    .await;
                    let answer = channel.ask(invocation_id, question).await?;
                    results_by_id.insert(invocation_id.clone(), DispatchStatus::Success(answer));
                }

                // Append tool-call records in parse order regardless of the
                // dispatcher's internal completion order (§8 invariant).
                for call in &tool_calls {
                    let Some(status) = results_by_id.get(&call.invocation_id) else {
                        continue;
                    };
                    let result_text = match status {
                        DispatchStatus::Success(text) => text.clone(),
                        DispatchStatus::Error(message) => {
                            had_error = true;
                            message.clone()
                        }
                        DispatchStatus::Skipped(reason) => reason.clone(),
                    };
                    let (call_msg, result_msg) =
                        render_tool_record(&self.config.parser, call, &result_text);
                    self.conversation.append(call_msg);
                    self.conversation.append(result_msg);
                }

                if let Some(EarlyExit::TaskCompletion(summary)) = &report.early_exit {
                    return Ok(self.finish(iteration + 1, summary.clone(), TerminationReason::TaskCompletion));
                }

                if had_error && self.config.stop_on_gadget_error {
                    return Ok(self.finish(iteration + 1, last_assistant_text, TerminationReason::GadgetError));
                }
            }

            if let Some(cap) = self.config.max_cost_usd {
                if self.ledger.total_cost_usd() >= cap {
                    return Ok(self.finish(iteration + 1, last_assistant_text, TerminationReason::CostCap));
                }
            }

            iteration += 1;
            if iteration >= self.config.max_iterations {
                return Ok(self.finish(iteration, last_assistant_text, TerminationReason::MaxIterations));
            }
        }
    }

    fn finish(&self, iterations: u32, final_text: String, reason: TerminationReason) -> AgentRunOutcome {
        AgentRunOutcome {
            final_text,
            iterations,
            usage: self.ledger.usage(),
            cost_usd: self.ledger.total_cost_usd(),
            reason,
        }
    }

    async fn publish(&self, observer: &Arc<dyn EventObserver>, kind: EventKind) {
        let event = self.event_allocator.emit(&self.run_root, now_ms(), kind);
        observer.on_event(&event).await;
    }

    async fn maybe_compact(
        &mut self,
        observer: &Arc<dyn EventObserver>,
        iteration_node: &ExecutionNode,
    ) -> Result<(), AgentError> {
        let Some(context_window) = self.descriptor.context_window else {
            return Ok(());
        };
        let estimated = estimate_tokens(&self.conversation.messages());
        if !self.compactor.should_compact(estimated, context_window) {
            return Ok(());
        }
        let outcome = self
            .compactor
            .compact(self.conversation.appended(), context_window, self.summarizer.as_deref())
            .await?;
        self.conversation.replace_appended(outcome.new_messages);
        let detail = serde_json::json!({
            "tokensBefore": outcome.tokens_before,
            "tokensAfter": outcome.tokens_after,
            "strategy": outcome.strategy_name,
        });
        let event = self.event_allocator.emit(
            iteration_node,
            now_ms(),
            EventKind::Compaction {
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
                strategy: outcome.strategy_name,
            },
        );
        observer.on_event(&event).await;
        self.hooks.notify_observers("onCompaction", &detail.to_string()).await;
        Ok(())
    }

    /// Streams one LLM call under the retry policy, feeding chunks to the
    /// stream parser and publishing `text`/`thinking` events as they arrive
    /// (§4.10 step 5, §4.3 thinking chunks "not appended to the conversation").
    async fn run_llm_call(
        &self,
        observer: &Arc<dyn EventObserver>,
        iteration_node: &ExecutionNode,
        cancellation: CancellationToken,
    ) -> Result<(String, Vec<crate::parser::ToolCallRecord>, Option<Usage>), AgentError> {
        let messages = self.conversation.messages();
        let remaining_budget = self.descriptor.context_window.map(|w| w.saturating_sub(
            estimate_tokens(&messages),
        ));
        let max_tokens = self.config.max_output_tokens_override.or_else(|| {
            match (self.descriptor.max_output_tokens, remaining_budget) {
                (Some(cap), Some(budget)) => Some(cap.min(budget)),
                (Some(cap), None) => Some(cap),
                (None, budget) => budget,
            }
        });
        let opts = StreamOptions {
            max_tokens,
            temperature: self.config.temperature,
            tools: None,
            tool_choice: None,
        };

        let mut attempt = 0u32;
        let stream = loop {
            attempt += 1;
            if cancellation.is_cancelled() {
                return Err(AgentError::Aborted);
            }
            match self.provider.stream(&messages, &self.model, &opts).await {
                Ok(stream) => break stream,
                Err(err) if self.retry.is_retryable(&err, None) && attempt <= self.retry.max_attempts() => {
                    let delay = self.retry.delay_for(attempt, err.retry_after_ms().map(std::time::Duration::from_millis));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => return Err(AgentError::Aborted),
                    }
                }
                Err(err) => {
                    let message = crate::events::llm_error_message(&err);
                    self.publish(observer, EventKind::LlmCallError { message: message.clone() }).await;
                    self.hooks.notify_observers("onLLMCallError", &serde_json::json!({ "message": message }).to_string()).await;
                    return Err(err.into());
                }
            }
        };

        let mut stream = stream;
        let mut parser = StreamParser::new(self.config.parser.clone());
        let mut usage = None;
        let mut text_buf = String::new();
        let mut tool_calls: Vec<crate::parser::ToolCallRecord> = Vec::new();

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            let message = crate::events::llm_error_message(&err);
                            self.publish(observer, EventKind::LlmCallError { message: message.clone() }).await;
                            self.hooks.notify_observers("onLLMCallError", &serde_json::json!({ "message": message }).to_string()).await;
                            return Err(err.into());
                        }
                    };
                    if let Some(thinking) = chunk.thinking {
                        let event = self.event_allocator.emit(iteration_node, now_ms(), EventKind::Thinking { fragment: thinking });
                        observer.on_event(&event).await;
                    }
                    if let Some(text) = chunk.text {
                        let intercepted = self
                            .hooks
                            .run_interceptors("interceptRawChunk", serde_json::Value::String(text.clone()))
                            .and_then(|v| v.as_str().map(str::to_string));
                        let Some(text) = intercepted else { continue };
                        text_buf.push_str(&text);
                        parser.feed(&text);
                        for event in parser.drain() {
                            self.handle_parse_event(observer, iteration_node, event, &mut tool_calls).await;
                        }
                    }
                    if let Some(u) = chunk.usage {
                        usage = Some(u);
                    }
                }
                _ = cancellation.cancelled() => {
                    self.publish(observer, EventKind::Abort).await;
                    self.hooks.notify_observers("onAbort", &serde_json::json!({ "midStream": true }).to_string()).await;
                    return Err(AgentError::Aborted);
                }
            }
        }

        for event in parser.finish() {
            self.handle_parse_event(observer, iteration_node, event, &mut tool_calls).await;
        }

        self.publish(observer, EventKind::StreamComplete).await;
        Ok((text_buf, tool_calls, usage))
    }

    /// Publishes a `text` event for text fragments (after interception) and
    /// appends tool-call records to `tool_calls` — shared between the
    /// mid-stream `drain()` loop and the end-of-stream `finish()` flush so
    /// calls discovered before the stream closes are never dropped.
    async fn handle_parse_event(
        &self,
        observer: &Arc<dyn EventObserver>,
        iteration_node: &ExecutionNode,
        event: ParseEvent,
        tool_calls: &mut Vec<crate::parser::ToolCallRecord>,
    ) {
        match event {
            ParseEvent::Text(text) => {
                let intercepted = self
                    .hooks
                    .run_interceptors("interceptTextChunk", serde_json::Value::String(text.clone()))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or(text);
                let event = self.event_allocator.emit(iteration_node, now_ms(), EventKind::Text { fragment: intercepted });
                observer.on_event(&event).await;
            }
            // `gadget_call` is emitted by the dispatcher once the call is
            // actually scheduled (§4.6 step 8); here we just collect it.
            ParseEvent::ToolCall(call) => tool_calls.push(call),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelObserver;
    use crate::hooks::HookPipeline;
    use runtime_core::model::ModelDescriptor;
    use runtime_core::provider::mock::{arc_mock, text_only_script};
    use runtime_core::provider::Chunk;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            known: true,
            context_window: Some(20_000),
            max_output_tokens: Some(4_096),
            ..Default::default()
        }
    }

    fn new_loop(scripts: Vec<Vec<Chunk>>, config: AgentLoopConfig) -> AgentLoop {
        new_loop_with_hooks(scripts, config, HookPipeline::new())
    }

    fn new_loop_with_hooks(scripts: Vec<Vec<Chunk>>, config: AgentLoopConfig, hooks: HookPipeline) -> AgentLoop {
        let provider = arc_mock(scripts);
        let conversation = ConversationStore::new(
            vec![ChatMessage::system("you are a helpful agent")],
            vec![ChatMessage::user("What is 15 * 23?")],
        );
        AgentLoop::new(
            conversation,
            provider,
            ModelId::parse("mock:test").unwrap(),
            descriptor(),
            ToolRegistry::new(),
            hooks,
            Compactor::new(Default::default(), crate::compaction::Strategy::SlidingWindow),
            None,
            RetryPolicy::default(),
            config,
            None,
        )
    }

    fn silent_observer() -> Arc<dyn EventObserver> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(ChannelObserver::new(tx))
    }

    #[tokio::test]
    async fn single_text_only_turn_terminates_at_iteration_one() {
        let agent = new_loop(vec![text_only_script("345")], AgentLoopConfig::default());
        let outcome = agent.run(silent_observer(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.final_text, "345");
        assert_eq!(outcome.iterations, 1);
        assert!(matches!(outcome.reason, TerminationReason::TextOnly));
    }

    #[tokio::test]
    async fn usage_accumulates_into_the_ledger() {
        let script = vec![Chunk {
            text: Some("345".into()),
            usage: Some(Usage { input_tokens: 12, output_tokens: 4, ..Default::default() }),
            ..Default::default()
        }];
        let agent = new_loop(vec![script], AgentLoopConfig::default());
        let outcome = agent.run(silent_observer(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.usage.input_tokens, 12);
        assert_eq!(outcome.usage.output_tokens, 4);
    }

    #[tokio::test]
    async fn max_iterations_bounds_text_only_acknowledge_loops() {
        let scripts = vec![
            text_only_script("thinking..."),
            text_only_script("still thinking..."),
            text_only_script("done"),
        ];
        let config = AgentLoopConfigBuilder::new()
            .max_iterations(2)
            .text_only_handler(TextOnlyHandler::Acknowledge)
            .build();
        let agent = new_loop(scripts, config);
        let outcome = agent.run(silent_observer(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.iterations, 2);
        assert!(matches!(outcome.reason, TerminationReason::MaxIterations));
    }

    #[tokio::test]
    async fn aborted_before_first_call_returns_cleanly() {
        let agent = new_loop(vec![text_only_script("345")], AgentLoopConfig::default());
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let outcome = agent.run(silent_observer(), cancellation).await.unwrap();
        assert!(matches!(outcome.reason, TerminationReason::Aborted));
    }

    struct RecordingObserver(parking_lot::Mutex<Vec<String>>);
    #[async_trait::async_trait]
    impl crate::hooks::Observer for RecordingObserver {
        async fn notify(&self, callback: &str, _detail: &str) {
            self.0.lock().push(callback.to_string());
        }
    }

    #[tokio::test]
    async fn llm_call_observers_fire_across_a_normal_turn() {
        let observer = Arc::new(RecordingObserver(parking_lot::Mutex::new(Vec::new())));
        let hooks = HookPipeline::new().with_observer(observer.clone());
        let agent = new_loop_with_hooks(vec![text_only_script("345")], AgentLoopConfig::default(), hooks);
        agent.run(silent_observer(), CancellationToken::new()).await.unwrap();
        let seen = observer.0.lock().clone();
        assert!(seen.contains(&"onLLMCallStart".to_string()));
        assert!(seen.contains(&"onLLMCallReady".to_string()));
        assert!(seen.contains(&"onLLMCallComplete".to_string()));
    }

    #[tokio::test]
    async fn on_abort_observer_fires_when_cancelled_before_first_call() {
        let observer = Arc::new(RecordingObserver(parking_lot::Mutex::new(Vec::new())));
        let hooks = HookPipeline::new().with_observer(observer.clone());
        let agent = new_loop_with_hooks(vec![text_only_script("345")], AgentLoopConfig::default(), hooks);
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        agent.run(silent_observer(), cancellation).await.unwrap();
        assert!(observer.0.lock().contains(&"onAbort".to_string()));
    }

    struct Shout;
    impl crate::hooks::Interceptor for Shout {
        fn intercept(&self, callback: &str, value: serde_json::Value) -> Option<serde_json::Value> {
            if callback != "interceptAssistantMessage" {
                return Some(value);
            }
            value.as_str().map(|s| serde_json::json!(format!("{}!", s.to_uppercase())))
        }
    }

    #[tokio::test]
    async fn intercept_assistant_message_rewrites_final_text_before_append() {
        let hooks = HookPipeline::new().with_interceptor(Arc::new(Shout));
        let agent = new_loop_with_hooks(vec![text_only_script("ok")], AgentLoopConfig::default(), hooks);
        let outcome = agent.run(silent_observer(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.final_text, "OK!");
    }
}

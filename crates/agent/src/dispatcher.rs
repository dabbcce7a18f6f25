//! Dispatcher (C7): builds a dependency DAG from one iteration's parsed
//! tool calls and executes it with bounded concurrency, hook interception,
//! and failed-dependency propagation.

use crate::error::AgentError;
use crate::events::{EventAllocator, EventKind, EventObserver, ExecutionNode, NodeAllocator};
use crate::hooks::{ControllerAction, HookPipeline};
use crate::parser::ToolCallRecord;
use crate::tool::{ToolContext, ToolError, ToolOutcome, ToolRegistry};
use async_trait::async_trait;
use runtime_core::schema::{render_errors, validate};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// How one invocation in a dispatch round resolved.
#[derive(Debug, Clone)]
pub enum DispatchStatus {
    Success(String),
    Error(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub invocation_id: String,
    pub gadget_name: String,
    pub status: DispatchStatus,
}

/// A tool's `Execute` raised one of the two control-flow sentinels (§4.4);
/// the dispatcher stops scheduling further rounds and reports it alongside
/// whatever results the current round already produced.
#[derive(Debug, Clone)]
pub enum EarlyExit {
    TaskCompletion(String),
    HumanInputRequired { invocation_id: String, question: String },
}

#[derive(Debug)]
pub struct DispatchReport {
    pub results: Vec<DispatchResult>,
    pub early_exit: Option<EarlyExit>,
}

/// Receives the `gadget_call → gadget_start → gadget_complete|gadget_error|
/// gadget_skipped` quartet for every invocation, so the caller (the agent
/// loop) can stamp each with its tree location and publish it.
#[async_trait]
pub trait DispatchEventSink: Send + Sync {
    async fn emit(&self, invocation_id: &str, kind: EventKind);

    /// This invocation's node in the execution tree. Only meaningful once
    /// `emit` has been called for `invocation_id` at least once — the
    /// dispatcher always emits `GadgetCall` before constructing a
    /// [`ToolContext`], so the node exists by the time it's needed.
    fn node_for(&self, invocation_id: &str) -> ExecutionNode;
}

/// Sink that drops every event, used where a caller only cares about
/// [`DispatchReport`]. Hands out a single shared root node to every
/// invocation since nothing downstream inspects it.
pub struct NullEventSink {
    allocator: NodeAllocator,
}

impl NullEventSink {
    pub fn new() -> Self {
        NullEventSink { allocator: NodeAllocator::new() }
    }
}

impl Default for NullEventSink {
    fn default() -> Self {
        NullEventSink::new()
    }
}

#[async_trait]
impl DispatchEventSink for NullEventSink {
    async fn emit(&self, _invocation_id: &str, _kind: EventKind) {}

    fn node_for(&self, _invocation_id: &str) -> ExecutionNode {
        self.allocator.root(crate::events::NodeKind::ToolCall, 0)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// `None` means unbounded — one worker per ready invocation.
    pub max_concurrency: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig { max_concurrency: None }
    }
}

pub struct Dispatcher {
    registry: ToolRegistry,
    hooks: HookPipeline,
    config: DispatcherConfig,
    node_allocator: Arc<NodeAllocator>,
    event_allocator: Arc<EventAllocator>,
    event_sink: Arc<dyn EventObserver>,
}

impl Dispatcher {
    pub fn new(
        registry: ToolRegistry,
        hooks: HookPipeline,
        config: DispatcherConfig,
        node_allocator: Arc<NodeAllocator>,
        event_allocator: Arc<EventAllocator>,
        event_sink: Arc<dyn EventObserver>,
    ) -> Self {
        Dispatcher { registry, hooks, config, node_allocator, event_allocator, event_sink }
    }

    /// Runs `calls` to completion (or to the first early exit) respecting
    /// dependency order, parse-order conversation-append semantics are the
    /// caller's responsibility via `results` preserving input order.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCallRecord>,
        cancellation: CancellationToken,
        sink: &dyn DispatchEventSink,
    ) -> Result<DispatchReport, AgentError> {
        detect_cycle(&calls)?;

        let by_id: HashMap<String, &ToolCallRecord> =
            calls.iter().map(|c| (c.invocation_id.clone(), c)).collect();
        let mut status: HashMap<String, DispatchStatus> = HashMap::new();
        let mut results: Vec<DispatchResult> = Vec::with_capacity(calls.len());
        let mut early_exit: Option<EarlyExit> = None;

        let permits = self.config.max_concurrency.unwrap_or_else(|| calls.len().max(1));
        let semaphore = Arc::new(Semaphore::new(permits.max(1)));

        let mut remaining: HashSet<String> = calls.iter().map(|c| c.invocation_id.clone()).collect();

        while !remaining.is_empty() && early_exit.is_none() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|id| {
                    let call = by_id[*id];
                    call.dependencies.iter().all(|dep| status.contains_key(dep))
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                // Every remaining call depends on something still pending,
                // which cannot happen once cycles are rejected — guard
                // against an empty round stalling forever.
                break;
            }

            let mut round = Vec::new();
            for id in &ready {
                let call = by_id[id].clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let deps_ok = call
                    .dependencies
                    .iter()
                    .all(|dep| matches!(status.get(dep), Some(DispatchStatus::Success(_))));
                let skip_decision = if call.dependencies.is_empty() || deps_ok {
                    None
                } else {
                    Some(self.decide_dependency_skip(&call).await?)
                };
                let cancellation = cancellation.clone();
                round.push(self.run_one(call, skip_decision, permit, cancellation, sink));
            }

            for outcome in futures::future::join_all(round).await {
                let (call_id, result, exit) = outcome?;
                remaining.remove(&call_id);
                if let Some(exit) = exit {
                    early_exit = Some(exit);
                }
                let (callback, detail_status) = match &result.status {
                    DispatchStatus::Skipped(reason) => ("onGadgetSkipped", serde_json::json!({ "skipped": reason })),
                    DispatchStatus::Success(value) => ("onGadgetExecutionComplete", serde_json::json!({ "result": value })),
                    DispatchStatus::Error(message) => ("onGadgetExecutionComplete", serde_json::json!({ "error": message })),
                };
                let detail = serde_json::json!({
                    "invocationId": result.invocation_id.clone(),
                    "gadgetName": result.gadget_name.clone(),
                    "status": detail_status,
                })
                .to_string();
                self.hooks.notify_observers(callback, &detail).await;
                status.insert(call_id, result.status.clone());
                results.push(result);
            }
        }

        Ok(DispatchReport { results, early_exit })
    }

    async fn decide_dependency_skip(&self, call: &ToolCallRecord) -> Result<DependencySkip, AgentError> {
        let context = serde_json::json!({
            "invocationId": call.invocation_id.clone(),
            "gadgetName": call.gadget_name.clone(),
            "dependencies": call.dependencies.clone(),
        });
        let action = self.hooks.run_controllers("onDependencySkipped", &context).await?;
        Ok(match action {
            ControllerAction::ExecuteAnyway => DependencySkip::ExecuteAnyway,
            ControllerAction::UseFallback { value } => DependencySkip::UseFallback(value),
            _ => DependencySkip::Propagate,
        })
    }

    #[allow(clippy::too_many_lines)]
    async fn run_one(
        &self,
        call: ToolCallRecord,
        skip_decision: Option<DependencySkip>,
        _permit: tokio::sync::OwnedSemaphorePermit,
        cancellation: CancellationToken,
        sink: &dyn DispatchEventSink,
    ) -> Result<(String, DispatchResult, Option<EarlyExit>), AgentError> {
        sink.emit(
            &call.invocation_id,
            EventKind::GadgetCall {
                invocation_id: call.invocation_id.clone(),
                gadget_name: call.gadget_name.clone(),
                parameters_raw: call.parameters_raw.clone(),
            },
        )
        .await;

        if let Some(skip) = skip_decision {
            return Ok(match skip {
                DependencySkip::Propagate => {
                    let reason = "an upstream dependency failed or was skipped".to_string();
                    sink.emit(
                        &call.invocation_id,
                        EventKind::GadgetSkipped { invocation_id: call.invocation_id.clone(), reason: reason.clone() },
                    )
                    .await;
                    (
                        call.invocation_id.clone(),
                        DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Skipped(reason) },
                        None,
                    )
                }
                DependencySkip::UseFallback(value) => {
                    sink.emit(
                        &call.invocation_id,
                        EventKind::GadgetComplete { invocation_id: call.invocation_id.clone(), result: value.clone() },
                    )
                    .await;
                    (
                        call.invocation_id.clone(),
                        DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Success(value) },
                        None,
                    )
                }
                DependencySkip::ExecuteAnyway => {
                    return self.execute(call, cancellation, sink).await;
                }
            });
        }

        if let Some(parse_error) = &call.parse_error {
            let message = format!("gadget call parse error: {parse_error}");
            sink.emit(&call.invocation_id, EventKind::GadgetError { invocation_id: call.invocation_id.clone(), message: message.clone() }).await;
            return Ok((
                call.invocation_id.clone(),
                DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Error(message) },
                None,
            ));
        }

        self.execute(call, cancellation, sink).await
    }

    async fn execute(
        &self,
        call: ToolCallRecord,
        cancellation: CancellationToken,
        sink: &dyn DispatchEventSink,
    ) -> Result<(String, DispatchResult, Option<EarlyExit>), AgentError> {
        let Some(tool) = self.registry.get(&call.gadget_name) else {
            let message = format!("gadget not registered: {}", call.gadget_name);
            sink.emit(&call.invocation_id, EventKind::GadgetError { invocation_id: call.invocation_id.clone(), message: message.clone() }).await;
            return Ok((
                call.invocation_id.clone(),
                DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Error(message) },
                None,
            ));
        };

        let params = match self.hooks.run_interceptors("interceptGadgetParameters", call.parameters.clone()) {
            Some(v) => v,
            None => call.parameters.clone(),
        };

        if let Err(errors) = validate(&tool.spec().parameter_schema, &params, &call.gadget_name) {
            let message = render_errors(&errors);
            sink.emit(&call.invocation_id, EventKind::GadgetError { invocation_id: call.invocation_id.clone(), message: message.clone() }).await;
            return Ok((
                call.invocation_id.clone(),
                DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Error(message) },
                None,
            ));
        }

        let before = self
            .hooks
            .run_controllers("beforeGadgetExecution", &serde_json::json!({ "invocationId": call.invocation_id }))
            .await?;
        if let ControllerAction::Skip { value } = before {
            sink.emit(&call.invocation_id, EventKind::GadgetComplete { invocation_id: call.invocation_id.clone(), result: value.clone() }).await;
            return Ok((
                call.invocation_id.clone(),
                DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Success(value) },
                None,
            ));
        }

        sink.emit(&call.invocation_id, EventKind::GadgetStart { invocation_id: call.invocation_id.clone() }).await;
        self.hooks
            .notify_observers(
                "onGadgetExecutionStart",
                &serde_json::json!({ "invocationId": call.invocation_id, "gadgetName": call.gadget_name }).to_string(),
            )
            .await;

        let ctx = ToolContext {
            invocation_id: call.invocation_id.clone(),
            cancellation,
            node: sink.node_for(&call.invocation_id),
            node_allocator: self.node_allocator.clone(),
            event_allocator: self.event_allocator.clone(),
            event_sink: self.event_sink.clone(),
        };
        let timeout = tool.spec().timeout;
        let outcome = tokio::time::timeout(timeout, tool.execute(&ctx, params)).await;

        match outcome {
            Err(_elapsed) => self.finish_error(call, format!("gadget timed out after {timeout:?}"), sink).await,
            Ok(Err(ToolError::InvalidParameters(msg))) => self.finish_error(call, msg, sink).await,
            Ok(Err(ToolError::Failed(msg))) => self.finish_error(call, msg, sink).await,
            Ok(Ok(ToolOutcome::Complete(summary))) => Ok((
                call.invocation_id.clone(),
                DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Success(summary.clone()) },
                Some(EarlyExit::TaskCompletion(summary)),
            )),
            Ok(Ok(ToolOutcome::NeedInput(question))) => {
                sink.emit(
                    &call.invocation_id,
                    EventKind::HumanInputRequired { invocation_id: call.invocation_id.clone(), question: question.clone() },
                )
                .await;
                Ok((
                    call.invocation_id.clone(),
                    DispatchResult { invocation_id: call.invocation_id.clone(), gadget_name: call.gadget_name, status: DispatchStatus::Success(question.clone()) },
                    Some(EarlyExit::HumanInputRequired { invocation_id: call.invocation_id, question }),
                ))
            }
            Ok(Ok(ToolOutcome::Done(success))) => {
                let transformed = self
                    .hooks
                    .run_interceptors("interceptGadgetResult", Value::String(success.result.clone()))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or(success.result);
                sink.emit(&call.invocation_id, EventKind::GadgetComplete { invocation_id: call.invocation_id.clone(), result: transformed.clone() }).await;
                Ok((
                    call.invocation_id.clone(),
                    DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Success(transformed) },
                    None,
                ))
            }
        }
    }

    async fn finish_error(
        &self,
        call: ToolCallRecord,
        message: String,
        sink: &dyn DispatchEventSink,
    ) -> Result<(String, DispatchResult, Option<EarlyExit>), AgentError> {
        let after = self
            .hooks
            .run_controllers("afterGadgetExecution", &serde_json::json!({ "invocationId": call.invocation_id, "error": message }))
            .await?;
        let final_message = match after {
            ControllerAction::Recover { value } => {
                sink.emit(&call.invocation_id, EventKind::GadgetComplete { invocation_id: call.invocation_id.clone(), result: value.clone() }).await;
                return Ok((
                    call.invocation_id.clone(),
                    DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Success(value) },
                    None,
                ));
            }
            _ => message,
        };
        sink.emit(&call.invocation_id, EventKind::GadgetError { invocation_id: call.invocation_id.clone(), message: final_message.clone() }).await;
        Ok((
            call.invocation_id.clone(),
            DispatchResult { invocation_id: call.invocation_id, gadget_name: call.gadget_name, status: DispatchStatus::Error(final_message) },
            None,
        ))
    }
}

enum DependencySkip {
    Propagate,
    ExecuteAnyway,
    UseFallback(String),
}

/// Detects cycles among `dependencies` via DFS, returning a deterministic
/// (sorted) error listing the cyclical invocation ids (§4.6 step 1).
fn detect_cycle(calls: &[ToolCallRecord]) -> Result<(), AgentError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let by_id: HashMap<&str, &ToolCallRecord> = calls.iter().map(|c| (c.invocation_id.as_str(), c)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut cyclical: HashSet<String> = HashSet::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a ToolCallRecord>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cyclical: &mut HashSet<String>,
    ) {
        match marks.get(id) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                if let Some(pos) = stack.iter().position(|s| *s == id) {
                    for node in &stack[pos..] {
                        cyclical.insert((*node).to_string());
                    }
                }
                return;
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(call) = by_id.get(id) {
            for dep in &call.dependencies {
                visit(dep.as_str(), by_id, marks, stack, cyclical);
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
    }

    for call in calls {
        let mut stack = Vec::new();
        visit(call.invocation_id.as_str(), &by_id, &mut marks, &mut stack, &mut cyclical);
    }

    if cyclical.is_empty() {
        Ok(())
    } else {
        let mut ids: Vec<String> = cyclical.into_iter().collect();
        ids.sort();
        Err(AgentError::DependencyCycle(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookPipeline;
    use crate::tool::{Tool, ToolContext as Ctx, ToolOutcome as Outcome, ToolSpec, ToolSuccess};
    use runtime_core::schema::ParamSchema;
    use serde_json::json;

    struct AlwaysOk;
    #[async_trait]
    impl Tool for AlwaysOk {
        fn spec(&self) -> &ToolSpec {
            static SPEC: std::sync::OnceLock<ToolSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| ToolSpec::new("ok", "always succeeds", ParamSchema::Object {
                description: "".into(),
                fields: Default::default(),
                required: vec![],
            }))
        }
        async fn execute(&self, _ctx: &Ctx, _params: Value) -> Result<Outcome, ToolError> {
            Ok(Outcome::Done(ToolSuccess::text("done")))
        }
    }

    fn call(id: &str, name: &str, deps: &[&str]) -> ToolCallRecord {
        ToolCallRecord {
            invocation_id: id.into(),
            gadget_name: name.into(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            parameters: json!({}),
            parameters_raw: String::new(),
            parse_error: None,
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(AlwaysOk));
        r
    }

    #[tokio::test]
    async fn runs_independent_calls_and_preserves_results_per_id() {
        let dispatcher = Dispatcher::new(registry(), HookPipeline::new(), DispatcherConfig::default(), Arc::new(crate::events::NodeAllocator::new()), Arc::new(crate::events::EventAllocator::new()), Arc::new(crate::events::ObserverFanout::new(vec![])));
        let calls = vec![call("a", "ok", &[]), call("b", "ok", &[])];
        let report = dispatcher.dispatch(calls, CancellationToken::new(), &NullEventSink::new()).await.unwrap();
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| matches!(r.status, DispatchStatus::Success(_))));
    }

    #[tokio::test]
    async fn detects_a_direct_cycle() {
        let dispatcher = Dispatcher::new(registry(), HookPipeline::new(), DispatcherConfig::default(), Arc::new(crate::events::NodeAllocator::new()), Arc::new(crate::events::EventAllocator::new()), Arc::new(crate::events::ObserverFanout::new(vec![])));
        let calls = vec![call("a", "ok", &["b"]), call("b", "ok", &["a"])];
        let err = dispatcher.dispatch(calls, CancellationToken::new(), &NullEventSink::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::DependencyCycle(_)));
    }

    #[tokio::test]
    async fn unregistered_gadget_yields_error_result_not_a_crash() {
        let dispatcher = Dispatcher::new(registry(), HookPipeline::new(), DispatcherConfig::default(), Arc::new(crate::events::NodeAllocator::new()), Arc::new(crate::events::EventAllocator::new()), Arc::new(crate::events::ObserverFanout::new(vec![])));
        let calls = vec![call("a", "missing", &[])];
        let report = dispatcher.dispatch(calls, CancellationToken::new(), &NullEventSink::new()).await.unwrap();
        assert!(matches!(report.results[0].status, DispatchStatus::Error(_)));
    }

    struct AlwaysFails;
    #[async_trait]
    impl Tool for AlwaysFails {
        fn spec(&self) -> &ToolSpec {
            static SPEC: std::sync::OnceLock<ToolSpec> = std::sync::OnceLock::new();
            SPEC.get_or_init(|| ToolSpec::new("fails", "always fails", ParamSchema::Object {
                description: "".into(),
                fields: Default::default(),
                required: vec![],
            }))
        }
        async fn execute(&self, _ctx: &Ctx, _params: Value) -> Result<Outcome, ToolError> {
            Err(ToolError::Failed("boom".into()))
        }
    }

    #[tokio::test]
    async fn downstream_of_a_failed_dependency_is_skipped_by_default() {
        let mut r = registry();
        r.register(Arc::new(AlwaysFails));
        let dispatcher = Dispatcher::new(r, HookPipeline::new(), DispatcherConfig::default(), Arc::new(crate::events::NodeAllocator::new()), Arc::new(crate::events::EventAllocator::new()), Arc::new(crate::events::ObserverFanout::new(vec![])));
        let calls = vec![call("a", "fails", &[]), call("b", "ok", &["a"])];
        let report = dispatcher.dispatch(calls, CancellationToken::new(), &NullEventSink::new()).await.unwrap();
        let b = report.results.iter().find(|r| r.invocation_id == "b").unwrap();
        assert!(matches!(b.status, DispatchStatus::Skipped(_)));
    }

    struct RecordingObserver(parking_lot::Mutex<Vec<String>>);
    #[async_trait]
    impl crate::hooks::Observer for RecordingObserver {
        async fn notify(&self, callback: &str, _detail: &str) {
            self.0.lock().push(callback.to_string());
        }
    }

    #[tokio::test]
    async fn gadget_lifecycle_observers_fire_for_success_and_skip() {
        let observer = Arc::new(RecordingObserver(parking_lot::Mutex::new(Vec::new())));
        let mut r = registry();
        r.register(Arc::new(AlwaysFails));
        let hooks = HookPipeline::new().with_observer(observer.clone());
        let dispatcher = Dispatcher::new(r, hooks, DispatcherConfig::default(), Arc::new(crate::events::NodeAllocator::new()), Arc::new(crate::events::EventAllocator::new()), Arc::new(crate::events::ObserverFanout::new(vec![])));
        let calls = vec![call("a", "fails", &[]), call("b", "ok", &["a"]), call("c", "ok", &[])];
        dispatcher.dispatch(calls, CancellationToken::new(), &NullEventSink::new()).await.unwrap();
        let seen = observer.0.lock().clone();
        assert!(seen.contains(&"onGadgetExecutionStart".to_string()));
        assert!(seen.contains(&"onGadgetExecutionComplete".to_string()));
        assert!(seen.contains(&"onGadgetSkipped".to_string()));
    }
}

//! Hook pipeline (C10): observers, interceptors, and controllers attached
//! at the LLM-call, tool-call, and loop lifecycle points.
//!
//! Grounded on the composite-driver pattern: a fixed ordered list of
//! handlers is walked sequentially per callback, with the first
//! terminal-ish result winning for controllers.

use crate::error::AgentError;
use async_trait::async_trait;
use runtime_core::chat::ChatMessage;
use serde_json::Value;
use std::sync::Arc;

/// The closed set of actions a [`Controller`] may return for a call,
/// named verbatim from the wire contract (§6).
#[derive(Debug, Clone)]
pub enum ControllerAction {
    Proceed,
    Skip { value: String },
    Continue,
    AppendMessages { messages: Vec<ChatMessage> },
    ModifyAndContinue { text: String },
    AppendAndModify { messages: Vec<ChatMessage>, text: String },
    Recover { value: String },
    Rethrow,
    ExecuteAnyway,
    UseFallback { value: String },
}

impl ControllerAction {
    /// A controller action is non-terminal (keeps walking the chain) only
    /// for `proceed` and `continue` (§4.9 Merge semantics).
    fn is_pass_through(&self) -> bool {
        matches!(self, ControllerAction::Proceed | ControllerAction::Continue)
    }

    /// Parses an action name from a dynamic source (e.g. a scripted test
    /// driver or a config-driven controller) into the closed set, faulting
    /// with a programmer-error for anything else (§4.9).
    pub fn from_name(name: &str, value: Option<String>) -> Result<Self, AgentError> {
        match name {
            "proceed" => Ok(ControllerAction::Proceed),
            "continue" => Ok(ControllerAction::Continue),
            "skip" => Ok(ControllerAction::Skip { value: value.unwrap_or_default() }),
            "recover" => Ok(ControllerAction::Recover { value: value.unwrap_or_default() }),
            "rethrow" => Ok(ControllerAction::Rethrow),
            "execute_anyway" => Ok(ControllerAction::ExecuteAnyway),
            "use_fallback" => Ok(ControllerAction::UseFallback { value: value.unwrap_or_default() }),
            other => Err(AgentError::UnknownControllerAction(other.to_string())),
        }
    }
}

/// Telemetry sink invoked for every named callback. Runs in parallel with
/// other observers for the same callback; errors are swallowed, never
/// propagated or allowed to short-circuit (§4.9).
#[async_trait]
pub trait Observer: Send + Sync {
    async fn notify(&self, callback: &str, detail: &str);
}

/// Pure, synchronous data transform. Interceptors run in registration order,
/// each threading its output into the next; returning `None` suppresses the
/// value entirely (§4.9: "Return null = suppress chunk").
pub trait Interceptor: Send + Sync {
    fn intercept(&self, callback: &str, value: Value) -> Option<Value>;
}

/// Async flow-control hook. Controllers run in registration order; the
/// first non-`proceed`/`continue` outcome wins and stops the chain (§4.9).
#[async_trait]
pub trait Controller: Send + Sync {
    async fn decide(&self, callback: &str, context: &Value) -> Result<ControllerAction, AgentError>;
}

/// The full set of hooks attached to one agent loop instance. Empty vectors
/// are the default (no hooks registered); composing two [`HookPipeline`]s
/// concatenates their handler lists per-category, preserving registration
/// order within each (§4.9 Merge semantics: "combining hook sets produces a
/// composition where... all registered functions are invoked").
#[derive(Clone, Default)]
pub struct HookPipeline {
    observers: Vec<Arc<dyn Observer>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    controllers: Vec<Arc<dyn Controller>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        HookPipeline::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Merges `other`'s handlers after this pipeline's, category by
    /// category, preserving each side's internal order.
    pub fn merge(mut self, mut other: HookPipeline) -> Self {
        self.observers.append(&mut other.observers);
        self.interceptors.append(&mut other.interceptors);
        self.controllers.append(&mut other.controllers);
        self
    }

    /// Fans `callback`/`detail` out to every observer concurrently,
    /// ignoring the order in which they complete.
    pub async fn notify_observers(&self, callback: &str, detail: &str) {
        let futures = self.observers.iter().map(|o| o.notify(callback, detail));
        futures::future::join_all(futures).await;
    }

    /// Threads `value` through every interceptor in registration order.
    /// Stops early if an interceptor suppresses the value with `None`.
    pub fn run_interceptors(&self, callback: &str, mut value: Value) -> Option<Value> {
        for interceptor in &self.interceptors {
            value = interceptor.intercept(callback, value)?;
        }
        Some(value)
    }

    /// Runs every controller in order; the first non-pass-through action
    /// wins. If every controller passes through (or none are registered),
    /// returns [`ControllerAction::Proceed`].
    pub async fn run_controllers(&self, callback: &str, context: &Value) -> Result<ControllerAction, AgentError> {
        for controller in &self.controllers {
            let action = controller.decide(callback, context).await?;
            if !action.is_pass_through() {
                return Ok(action);
            }
        }
        Ok(ControllerAction::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Observer for Counter {
        async fn notify(&self, _callback: &str, _detail: &str) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn observers_all_run_regardless_of_order() {
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        let pipeline = HookPipeline::new().with_observer(a.clone()).with_observer(b.clone());
        pipeline.notify_observers("onLLMCallStart", "{}").await;
        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 1);
    }

    struct Uppercase;
    impl Interceptor for Uppercase {
        fn intercept(&self, _callback: &str, value: Value) -> Option<Value> {
            value.as_str().map(|s| json!(s.to_uppercase()))
        }
    }
    struct Suppress;
    impl Interceptor for Suppress {
        fn intercept(&self, _callback: &str, _value: Value) -> Option<Value> {
            None
        }
    }

    #[test]
    fn interceptors_thread_value_in_order() {
        let pipeline = HookPipeline::new().with_interceptor(Arc::new(Uppercase));
        let out = pipeline.run_interceptors("interceptTextChunk", json!("hi"));
        assert_eq!(out, Some(json!("HI")));
    }

    #[test]
    fn interceptor_returning_none_suppresses_value() {
        let pipeline = HookPipeline::new()
            .with_interceptor(Arc::new(Uppercase))
            .with_interceptor(Arc::new(Suppress));
        assert_eq!(pipeline.run_interceptors("interceptTextChunk", json!("hi")), None);
    }

    struct PassThrough;
    #[async_trait]
    impl Controller for PassThrough {
        async fn decide(&self, _callback: &str, _context: &Value) -> Result<ControllerAction, AgentError> {
            Ok(ControllerAction::Proceed)
        }
    }
    struct Skipper;
    #[async_trait]
    impl Controller for Skipper {
        async fn decide(&self, _callback: &str, _context: &Value) -> Result<ControllerAction, AgentError> {
            Ok(ControllerAction::Skip { value: "cached".into() })
        }
    }
    struct NeverReached(AtomicUsize);
    #[async_trait]
    impl Controller for NeverReached {
        async fn decide(&self, _callback: &str, _context: &Value) -> Result<ControllerAction, AgentError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(ControllerAction::Proceed)
        }
    }

    #[tokio::test]
    async fn first_non_pass_through_controller_wins() {
        let tail = Arc::new(NeverReached(AtomicUsize::new(0)));
        let pipeline = HookPipeline::new()
            .with_controller(Arc::new(PassThrough))
            .with_controller(Arc::new(Skipper))
            .with_controller(tail.clone());
        let action = pipeline.run_controllers("beforeLLMCall", &json!({})).await.unwrap();
        assert!(matches!(action, ControllerAction::Skip { value } if value == "cached"));
        assert_eq!(tail.0.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn no_controllers_defaults_to_proceed() {
        let pipeline = HookPipeline::new();
        let action = pipeline.run_controllers("beforeLLMCall", &json!({})).await.unwrap();
        assert!(matches!(action, ControllerAction::Proceed));
    }

    #[test]
    fn unknown_action_name_is_rejected() {
        let err = ControllerAction::from_name("teleport", None).unwrap_err();
        assert!(matches!(err, AgentError::UnknownControllerAction(name) if name == "teleport"));
    }

    #[test]
    fn merge_preserves_registration_order_within_each_category() {
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        let left = HookPipeline::new().with_observer(a);
        let right = HookPipeline::new().with_observer(b);
        let merged = left.merge(right);
        assert_eq!(merged.observers.len(), 2);
    }
}

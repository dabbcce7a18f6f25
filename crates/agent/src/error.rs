//! Structured error type for the agent crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the loop, dispatcher, parser and compactor. Provider
/// errors that survive retry exhaustion are wrapped in [`AgentError::Llm`]
/// rather than re-derived here.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AgentError {
    #[error("provider error: {0}")]
    Llm(String),

    #[error("dependency cycle among invocations: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("unknown controller action: {0}")]
    UnknownControllerAction(String),

    #[error("gadget not registered: {0}")]
    UnknownGadget(String),

    #[error("compaction failed: {0}")]
    Compaction(String),

    #[error("human input required but no resume channel is attached")]
    NoResumeChannel,

    #[error("run was aborted")]
    Aborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<runtime_core::LLMError> for AgentError {
    fn from(err: runtime_core::LLMError) -> Self {
        AgentError::Llm(err.to_string())
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_error_wraps_with_message_preserved() {
        let llm = runtime_core::LLMError::Auth("bad key".into());
        let agent: AgentError = llm.into();
        assert!(matches!(agent, AgentError::Llm(msg) if msg.contains("bad key")));
    }

    #[test]
    fn agent_error_serde_round_trip() {
        let original = AgentError::DependencyCycle(vec!["a".into(), "b".into()]);
        let json = serde_json::to_string(&original).unwrap();
        let restored: AgentError = serde_json::from_str(&json).unwrap();
        assert_eq!(original.to_string(), restored.to_string());
    }
}

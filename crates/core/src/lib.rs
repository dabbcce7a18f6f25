//! `runtime-core` is the provider-facing half of the agentic runtime: model
//! identity and catalog lookups, the message model, the provider adapter
//! contract, retry/backoff, and the tagged-union parameter schema
//! interpreter. It never touches the filesystem or the network itself —
//! those are the concern of whatever `ProviderAdapter` implementation a
//! caller plugs in.
//!
//! The agent loop, stream parser, dispatcher, hook pipeline and compaction
//! live one layer up in `runtime-agent`, which depends on this crate.

/// Role-tagged message model shared between the conversation store and the
/// provider adapter contract.
pub mod chat;

/// Error types for the provider adapter contract and retry policy.
pub mod error;

/// `provider:name` identifiers and the in-memory model catalog.
pub mod model;

/// The provider adapter contract: `supports`, `stream`, `count_tokens`.
pub mod provider;

/// Static catalog data types (context window, pricing, feature flags).
pub mod providers;

/// Retry classification, backoff computation, and Retry-After parsing.
pub mod retry;

/// Tagged-union parameter schemas and their interpreter.
pub mod schema;

pub use error::LLMError;

use serde::{Deserialize, Serialize};

/// A tool call the model asked to make, standardized across providers.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

/// The name and raw argument payload of a single tool call.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass to the function, typically a JSON string.
    pub arguments: String,
}

/// Token accounting for one LLM call, tolerant of each vendor's own field
/// names (see `spec.md` §3 and the Usage entity: `inputTokens + outputTokens
/// = totalTokens` when all fields are present).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(
        alias = "prompt_tokens",
        alias = "input_tokens",
        alias = "prompt_eval_count",
        alias = "promptTokenCount"
    )]
    pub input_tokens: u32,
    #[serde(
        alias = "completion_tokens",
        alias = "output_tokens",
        alias = "eval_count",
        alias = "candidatesTokenCount"
    )]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulates another call's usage into this running total.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_input_tokens = match (self.cached_input_tokens, other.cached_input_tokens) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.cache_creation_input_tokens = match (
            self.cache_creation_input_tokens,
            other.cache_creation_input_tokens,
        ) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.reasoning_tokens = match (self.reasoning_tokens, other.reasoning_tokens) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates_across_calls() {
        let mut total = Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        };
        total.add(&Usage {
            input_tokens: 3,
            output_tokens: 2,
            cached_input_tokens: Some(1),
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.total_tokens(), 20);
        assert_eq!(total.cached_input_tokens, Some(1));
    }

    #[test]
    fn usage_deserializes_vendor_aliases() {
        let anthropic: Usage =
            serde_json::from_str(r#"{"input_tokens": 100, "output_tokens": 40}"#).unwrap();
        assert_eq!(anthropic.total_tokens(), 140);

        let openai: Usage =
            serde_json::from_str(r#"{"prompt_tokens": 100, "completion_tokens": 40}"#).unwrap();
        assert_eq!(openai.total_tokens(), 140);

        let ollama: Usage =
            serde_json::from_str(r#"{"prompt_eval_count": 7, "eval_count": 3}"#).unwrap();
        assert_eq!(ollama.total_tokens(), 10);
    }
}

//! The provider adapter contract (C3): a small async surface vendor-specific
//! HTTP clients implement. `runtime-core` ships no real adapters — only the
//! contract and a deterministic [`MockAdapter`] for tests (feature
//! `test-util`).

use crate::chat::ChatMessage;
use crate::error::LLMError;
use crate::model::ModelId;
use crate::Usage;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One delta from a provider's streamed response.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub text: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub thinking: Option<String>,
    pub raw_event: Option<serde_json::Value>,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Chunk {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Options that shape a single `stream` call: sampling parameters and the
/// token budget the agent loop computed for this iteration (C11 step 3).
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub tools: Option<Vec<crate::chat::Tool>>,
    pub tool_choice: Option<crate::chat::ToolChoice>,
}

/// A streamed sequence of [`Chunk`]s. Single-consumer and lazy: nothing is
/// sent until the stream is polled. Implementations must honor cancellation
/// by racing their transport read against the caller's cancellation signal
/// and yielding [`LLMError::Aborted`] when it fires.
pub type ChunkStream<'a> = BoxStream<'a, Result<Chunk, LLMError>>;

/// Contract every LLM provider adapter implements (C3).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Whether this adapter can serve the given model.
    fn supports(&self, descriptor: &ModelId) -> bool;

    /// Relative priority among adapters that all `supports` a descriptor.
    /// Higher wins; mock adapters default to 100, real adapters to 0, so a
    /// test-util mock registered alongside a real adapter is picked first.
    fn priority(&self) -> i32 {
        0
    }

    /// Streams a chat completion. `descriptor` has already been resolved
    /// against the catalog; `opts` carries sampling and tool parameters.
    async fn stream<'a>(
        &'a self,
        messages: &[ChatMessage],
        descriptor: &ModelId,
        opts: &StreamOptions,
    ) -> Result<ChunkStream<'a>, LLMError>;

    /// Counts tokens for the given messages against this model. The
    /// character-based fallback (`ceil(totalChars/4) + 765*imageCount`) is
    /// provided as [`estimate_tokens`] for adapters with no precise
    /// tokenizer.
    async fn count_tokens(
        &self,
        messages: &[ChatMessage],
        descriptor: &ModelId,
    ) -> Result<u64, LLMError> {
        let _ = descriptor;
        Ok(estimate_tokens(messages))
    }
}

/// Character-based token estimate: `ceil(totalChars / 4) + 765 * imageCount`
/// (§4.3). Used as the default `count_tokens` fallback and directly by the
/// compactor when no adapter-specific count is available.
pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    let mut total_chars = 0usize;
    let mut image_count = 0usize;
    for message in messages {
        total_chars += message.content.as_text().chars().count();
        image_count += message.content.image_count();
    }
    let text_tokens = total_chars.div_ceil(4) as u64;
    text_tokens + 765 * image_count as u64
}

/// Selects the highest-priority adapter among those that `supports` the
/// given descriptor.
pub fn select_adapter<'a>(
    adapters: &'a [std::sync::Arc<dyn ProviderAdapter>],
    descriptor: &ModelId,
) -> Option<&'a std::sync::Arc<dyn ProviderAdapter>> {
    adapters
        .iter()
        .filter(|adapter| adapter.supports(descriptor))
        .max_by_key(|adapter| adapter.priority())
}

#[cfg(feature = "test-util")]
pub mod mock {
    use super::*;
    use futures::stream;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// A scripted response: a sequence of chunks to emit in order.
    pub type Script = Vec<Chunk>;

    /// Deterministic [`ProviderAdapter`] for tests: returns a pre-scripted
    /// chunk sequence for whatever model it is asked to serve, recording
    /// every call it received for later assertions. Priority 100, so it
    /// outranks any real adapter registered alongside it.
    pub struct MockAdapter {
        scripts: Mutex<Vec<Script>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl MockAdapter {
        pub fn new(scripts: Vec<Script>) -> Self {
            MockAdapter {
                scripts: Mutex::new(scripts),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn supports(&self, _descriptor: &ModelId) -> bool {
            true
        }

        fn priority(&self) -> i32 {
            100
        }

        async fn stream<'a>(
            &'a self,
            messages: &[ChatMessage],
            _descriptor: &ModelId,
            _opts: &StreamOptions,
        ) -> Result<ChunkStream<'a>, LLMError> {
            self.calls.lock().push(messages.to_vec());
            let script = {
                let mut scripts = self.scripts.lock();
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };
            let items: Vec<Result<Chunk, LLMError>> = script.into_iter().map(Ok).collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    /// Builds a single-chunk script emitting `text` with no tool calls.
    pub fn text_only_script(text: impl Into<String>) -> Script {
        vec![Chunk::text(text)]
    }

    pub fn arc_mock(scripts: Vec<Script>) -> Arc<MockAdapter> {
        Arc::new(MockAdapter::new(scripts))
    }
}

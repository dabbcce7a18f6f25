//! Compactor (C9): shrinks the conversation's appended region toward a
//! target size once estimated tokens cross a trigger threshold.

use crate::error::AgentError;
use async_trait::async_trait;
use runtime_core::chat::ChatMessage;
use runtime_core::provider::estimate_tokens;

/// Thresholds a [`Compactor`] checks before invoking a strategy.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    pub trigger_threshold_percent: f64,
    pub target_percent: f64,
    pub preserve_recent_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            trigger_threshold_percent: 0.85,
            target_percent: 0.5,
            preserve_recent_turns: 4,
        }
    }
}

/// One user→assistant exchange plus any tool-call records interleaved
/// between them, the unit sliding-window and summarization partition on.
#[derive(Debug, Clone)]
struct Turn {
    messages: Vec<ChatMessage>,
}

/// Result of running a compaction strategy.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub new_messages: Vec<ChatMessage>,
    pub strategy_name: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub turns_removed: usize,
}

/// Summarizes a group of turns into a single message, implemented against
/// a (possibly secondary, cheaper) model. Kept as a trait so the
/// summarization strategy needs no direct provider dependency.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[ChatMessage]) -> Result<String, AgentError>;
}

fn partition_turns(messages: &[ChatMessage]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut current: Vec<ChatMessage> = Vec::new();
    for message in messages {
        current.push(message.clone());
        if matches!(message.role, runtime_core::chat::ChatRole::Assistant) {
            turns.push(Turn { messages: std::mem::take(&mut current) });
        }
    }
    if !current.is_empty() {
        turns.push(Turn { messages: current });
    }
    turns
}

fn truncation_marker(removed: usize) -> ChatMessage {
    ChatMessage::system(format!(
        "[Previous conversation truncated. Removed {removed} turn(s)…]"
    ))
}

/// Drops the oldest turns one at a time — never below `preserve_recent_turns`
/// — until the estimate lands at or under `targetPercent · contextWindow`
/// (§4.8), returning as soon as that target is met rather than always
/// dropping every removable turn in one shot.
fn sliding_window(appended: &[ChatMessage], cfg: &CompactionConfig, context_window: u64) -> CompactionOutcome {
    let tokens_before = estimate_tokens(appended);
    let turns = partition_turns(appended);
    if turns.len() <= cfg.preserve_recent_turns {
        return CompactionOutcome {
            new_messages: appended.to_vec(),
            strategy_name: "sliding-window".into(),
            tokens_before,
            tokens_after: tokens_before,
            turns_removed: 0,
        };
    }
    let target_tokens = (cfg.target_percent * context_window as f64) as u64;
    let max_removable = turns.len() - cfg.preserve_recent_turns;

    let mut removed = 1;
    loop {
        let mut new_messages = vec![truncation_marker(removed)];
        for turn in &turns[removed..] {
            new_messages.extend(turn.messages.clone());
        }
        let tokens_after = estimate_tokens(&new_messages);
        if tokens_after <= target_tokens || removed >= max_removable {
            return CompactionOutcome {
                new_messages,
                strategy_name: "sliding-window".into(),
                tokens_before,
                tokens_after,
                turns_removed: removed,
            };
        }
        removed += 1;
    }
}

/// Collapses every turn older than `preserve_recent_turns` into a single
/// summary message — already the smallest footprint this strategy can
/// produce at turn granularity, so unlike `sliding_window` it has no
/// incremental knob to drive toward `target_percent`; the summarizer's own
/// brevity is what gets the result under the target.
async fn summarization(
    appended: &[ChatMessage],
    cfg: &CompactionConfig,
    summarizer: &dyn Summarizer,
) -> Result<CompactionOutcome, AgentError> {
    let tokens_before = estimate_tokens(appended);
    let turns = partition_turns(appended);
    if turns.len() <= cfg.preserve_recent_turns {
        return Ok(CompactionOutcome {
            new_messages: appended.to_vec(),
            strategy_name: "summarization".into(),
            tokens_before,
            tokens_after: tokens_before,
            turns_removed: 0,
        });
    }
    let keep_from = turns.len() - cfg.preserve_recent_turns;
    let older: Vec<ChatMessage> = turns[..keep_from].iter().flat_map(|t| t.messages.clone()).collect();
    let summary = summarizer.summarize(&older).await?;
    let mut new_messages = vec![ChatMessage::system(summary)];
    for turn in &turns[keep_from..] {
        new_messages.extend(turn.messages.clone());
    }
    let tokens_after = estimate_tokens(&new_messages);
    Ok(CompactionOutcome {
        new_messages,
        strategy_name: "summarization".into(),
        tokens_before,
        tokens_after,
        turns_removed: keep_from,
    })
}

/// A compaction strategy, selected up front for an agent instance.
#[derive(Clone)]
pub enum Strategy {
    SlidingWindow,
    Summarization,
    /// Falls back to sliding-window when the summarizable region has
    /// fewer than 3 turns; otherwise summarizes (§4.8).
    Hybrid,
}

/// Queried by the loop before each LLM call with the current token
/// estimate and model context window.
pub struct Compactor {
    pub config: CompactionConfig,
    pub strategy: Strategy,
}

impl Compactor {
    pub fn new(config: CompactionConfig, strategy: Strategy) -> Self {
        Compactor { config, strategy }
    }

    pub fn should_compact(&self, estimated_tokens: u64, context_window: u64) -> bool {
        (estimated_tokens as f64) >= self.config.trigger_threshold_percent * (context_window as f64)
    }

    /// Runs the configured strategy over the appended region. `base` and
    /// `initial` are never passed in and so can never be compacted (§4.8
    /// invariant). `context_window` is the model's context window, against
    /// which `targetPercent` is measured.
    pub async fn compact(
        &self,
        appended: &[ChatMessage],
        context_window: u64,
        summarizer: Option<&dyn Summarizer>,
    ) -> Result<CompactionOutcome, AgentError> {
        match self.strategy {
            Strategy::SlidingWindow => Ok(sliding_window(appended, &self.config, context_window)),
            Strategy::Summarization => {
                let summarizer = summarizer.ok_or_else(|| {
                    AgentError::Compaction("summarization strategy requires a summarizer".into())
                })?;
                summarization(appended, &self.config, summarizer).await
            }
            Strategy::Hybrid => {
                let turns = partition_turns(appended);
                let summarizable = turns.len().saturating_sub(self.config.preserve_recent_turns);
                if summarizable < 3 {
                    Ok(sliding_window(appended, &self.config, context_window))
                } else {
                    let summarizer = summarizer.ok_or_else(|| {
                        AgentError::Compaction("hybrid strategy requires a summarizer".into())
                    })?;
                    summarization(appended, &self.config, summarizer).await
                }
            }
        }
    }
}

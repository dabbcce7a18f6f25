//! Cost/usage ledger (C13): accumulates token usage and monetary cost
//! across an entire run, deriving token cost from the model's pricing and
//! folding in whatever a tool reports for its own execution.

use runtime_core::providers::ModelPricing;
use runtime_core::Usage;

/// Whether cached input tokens are subtracted from billed input tokens
/// before pricing is applied. Left configurable per §9 DESIGN NOTES Open
/// Questions ("leave as configurable (default: no subtraction, reflect
/// vendor invoice semantics)").
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerConfig {
    pub subtract_cached_from_input: bool,
}

/// Running totals for one run: accumulated [`Usage`], token cost derived
/// from model pricing, and monetary cost reported directly by tools.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    config: LedgerConfig,
    usage: Usage,
    token_cost_usd: f64,
    tool_cost_usd: f64,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        Ledger {
            config,
            usage: Usage::default(),
            token_cost_usd: 0.0,
            tool_cost_usd: 0.0,
        }
    }

    /// Folds one LLM call's usage into the running total and derives its
    /// dollar cost from `pricing` (per-million-token rates).
    pub fn record_usage(&mut self, usage: &Usage, pricing: &ModelPricing) {
        self.usage.add(usage);

        let billed_input = if self.config.subtract_cached_from_input {
            usage
                .input_tokens
                .saturating_sub(usage.cached_input_tokens.unwrap_or(0))
        } else {
            usage.input_tokens
        };

        let per_million = |tokens: u32, rate: Option<f64>| {
            rate.map(|r| (tokens as f64 / 1_000_000.0) * r).unwrap_or(0.0)
        };

        self.token_cost_usd += per_million(billed_input, pricing.input);
        self.token_cost_usd += per_million(usage.output_tokens, pricing.output);
        if let Some(cached) = usage.cached_input_tokens {
            self.token_cost_usd += per_million(cached, pricing.cached_input);
        }
        if let Some(created) = usage.cache_creation_input_tokens {
            self.token_cost_usd += per_million(created, pricing.cache_creation_input);
        }
    }

    /// Folds a tool's self-reported monetary cost into the total.
    pub fn record_tool_cost(&mut self, cost: crate::tool::ToolCost) {
        self.tool_cost_usd += cost.usd;
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn token_cost_usd(&self) -> f64 {
        self.token_cost_usd
    }

    pub fn tool_cost_usd(&self) -> f64 {
        self.tool_cost_usd
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.token_cost_usd + self.tool_cost_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> ModelPricing {
        ModelPricing {
            input: Some(3.0),
            output: Some(15.0),
            cached_input: Some(0.3),
            cache_creation_input: Some(3.75),
        }
    }

    #[test]
    fn accumulates_token_cost_across_calls() {
        let mut ledger = Ledger::new(LedgerConfig::default());
        ledger.record_usage(
            &Usage {
                input_tokens: 1_000_000,
                output_tokens: 100_000,
                ..Default::default()
            },
            &pricing(),
        );
        assert!((ledger.token_cost_usd() - 4.5).abs() < 1e-9);
        assert_eq!(ledger.usage().input_tokens, 1_000_000);
    }

    #[test]
    fn default_does_not_subtract_cached_tokens_from_billed_input() {
        let mut ledger = Ledger::new(LedgerConfig::default());
        ledger.record_usage(
            &Usage {
                input_tokens: 1_000_000,
                cached_input_tokens: Some(400_000),
                ..Default::default()
            },
            &pricing(),
        );
        // 1_000_000 input tokens billed in full at $3/M, plus 400_000 cached
        // tokens billed separately at $0.30/M.
        assert!((ledger.token_cost_usd() - (3.0 + 0.12)).abs() < 1e-9);
    }

    #[test]
    fn subtract_cached_reduces_billed_input() {
        let mut ledger = Ledger::new(LedgerConfig { subtract_cached_from_input: true });
        ledger.record_usage(
            &Usage {
                input_tokens: 1_000_000,
                cached_input_tokens: Some(400_000),
                ..Default::default()
            },
            &pricing(),
        );
        // 600_000 billed at $3/M plus 400_000 cached at $0.30/M.
        assert!((ledger.token_cost_usd() - (1.8 + 0.12)).abs() < 1e-9);
    }

    #[test]
    fn tool_cost_adds_on_top_of_token_cost() {
        let mut ledger = Ledger::new(LedgerConfig::default());
        ledger.record_tool_cost(crate::tool::ToolCost { usd: 0.05 });
        ledger.record_tool_cost(crate::tool::ToolCost { usd: 0.02 });
        assert!((ledger.tool_cost_usd() - 0.07).abs() < 1e-9);
        assert!((ledger.total_cost_usd() - 0.07).abs() < 1e-9);
    }
}

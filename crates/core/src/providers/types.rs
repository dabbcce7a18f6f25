//! On-disk-free model catalog types.
//!
//! `runtime-core` never reads a file or makes a network call to populate
//! this catalog (see `spec.md` §6 EXTERNAL INTERFACES: "the core does not
//! read the filesystem") — callers build a [`ProvidersRegistry`] however
//! they like (embedded JSON, a config layer upstream, a test fixture) and
//! hand it to [`crate::model::ModelCatalog`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A full catalog of providers, each with their own model table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersRegistry {
    pub providers: HashMap<String, ProviderInfo>,
}

impl From<HashMap<String, ProviderInfo>> for ProvidersRegistry {
    fn from(map: HashMap<String, ProviderInfo>) -> Self {
        ProvidersRegistry { providers: map }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProviderInfo {
    pub id: String,
    #[serde(default)]
    pub env: Vec<String>,
    pub name: String,
    pub doc: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, ModelInfo>,
}

/// A single catalog entry, keyed by `provider:name` in [`ProvidersRegistry`].
///
/// Mirrors §4.1's `{contextWindow, maxOutputTokens, pricing, features, metadata}`
/// lookup result.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub features: ModelFeatures,
    #[serde(rename = "limit", default)]
    pub constraints: ModelConstraints,
    #[serde(rename = "cost", default)]
    pub pricing: ModelPricing,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ModelFeatures {
    pub streaming: bool,
    pub vision: bool,
    pub reasoning: bool,
    pub function_calling: bool,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ModelConstraints {
    pub context_window: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub open_weights: Option<bool>,
}

/// Per-million-token pricing, USD. Any field left `None` means "free/unknown"
/// rather than zero, so callers can distinguish the two in the cost ledger.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ModelPricing {
    pub input: Option<f64>,
    pub output: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input: Option<f64>,
}

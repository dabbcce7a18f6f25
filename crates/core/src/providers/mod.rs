mod queries;
mod types;

pub use types::{
    ModelConstraints, ModelFeatures, ModelInfo, ModelPricing, ProviderInfo, ProvidersRegistry,
};

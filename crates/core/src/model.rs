//! Model identifiers and catalog lookups (C1).

use crate::error::ModelIdError;
use crate::providers::{ModelConstraints, ModelFeatures, ModelPricing, ProvidersRegistry};
use std::collections::HashMap;

/// A parsed `provider:name` identifier, or a bare alias awaiting resolution
/// against a [`ModelCatalog`]'s alias table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId {
    pub provider: Option<String>,
    pub name: String,
}

impl ModelId {
    /// Parses `provider:name`, or a bare name with no provider qualifier.
    /// Fails with [`ModelIdError::Empty`] when the name portion is empty.
    pub fn parse(id: &str) -> Result<Self, ModelIdError> {
        let (provider, name) = match id.split_once(':') {
            Some((provider, name)) => (Some(provider.to_string()), name.to_string()),
            None => (None, id.to_string()),
        };
        if name.is_empty() {
            return Err(ModelIdError::Empty);
        }
        Ok(ModelId { provider, name })
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{provider}:{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Catalog entry returned by [`ModelCatalog::lookup`]. The `unknown()`
/// constructor is the "unknown-model sentinel" called for in §4.1: callers
/// that miss the catalog treat caps as "use provider default" rather than
/// failing the request.
#[derive(Debug, Clone, Default)]
pub struct ModelDescriptor {
    pub known: bool,
    pub context_window: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub pricing: ModelPricing,
    pub features: ModelFeatures,
}

impl ModelDescriptor {
    pub fn unknown() -> Self {
        ModelDescriptor::default()
    }

    fn from_constraints(constraints: &ModelConstraints) -> (Option<u64>, Option<u64>) {
        (constraints.context_window, constraints.max_output_tokens)
    }
}

/// Wraps a [`ProvidersRegistry`] with an alias table so callers can refer to
/// models by a short name (`"sonnet"`) instead of the full `provider:name`.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    registry: ProvidersRegistry,
    aliases: HashMap<String, ModelId>,
}

impl ModelCatalog {
    pub fn new(registry: ProvidersRegistry) -> Self {
        ModelCatalog {
            registry,
            aliases: HashMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>, target: ModelId) -> Self {
        self.aliases.insert(alias.into(), target);
        self
    }

    /// Resolves a bare alias (no `provider:` prefix) to its canonical
    /// identifier, if one was registered. Identifiers that already carry a
    /// provider pass through unchanged.
    pub fn resolve(&self, id: &ModelId) -> ModelId {
        if id.provider.is_some() {
            return id.clone();
        }
        self.aliases.get(&id.name).cloned().unwrap_or_else(|| id.clone())
    }

    /// Looks up catalog data for an identifier, resolving aliases first.
    /// Returns the unknown-model sentinel on a miss rather than an error.
    pub fn lookup(&self, id: &ModelId) -> ModelDescriptor {
        let resolved = self.resolve(id);
        let Some(provider) = resolved.provider.as_deref() else {
            return ModelDescriptor::unknown();
        };
        match self.registry.get_model(provider, &resolved.name) {
            Some(model) => {
                let (context_window, max_output_tokens) =
                    ModelDescriptor::from_constraints(&model.constraints);
                ModelDescriptor {
                    known: true,
                    context_window,
                    max_output_tokens,
                    pricing: model.pricing.clone(),
                    features: model.features.clone(),
                }
            }
            None => ModelDescriptor::unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderInfo;
    use std::collections::HashMap as Map;

    fn catalog() -> ModelCatalog {
        let mut models = Map::new();
        models.insert(
            "gpt-4".to_string(),
            crate::providers::ModelInfo {
                id: "gpt-4".to_string(),
                name: "GPT-4".to_string(),
                constraints: ModelConstraints {
                    context_window: Some(128_000),
                    max_output_tokens: Some(4_096),
                    open_weights: None,
                },
                ..Default::default()
            },
        );
        let mut providers = Map::new();
        providers.insert(
            "openai".to_string(),
            ProviderInfo {
                id: "openai".to_string(),
                name: "OpenAI".to_string(),
                models,
                ..Default::default()
            },
        );
        ModelCatalog::new(ProvidersRegistry::from(providers)).with_alias(
            "gpt4",
            ModelId::parse("openai:gpt-4").unwrap(),
        )
    }

    #[test]
    fn parse_rejects_empty_name() {
        assert_eq!(ModelId::parse(""), Err(ModelIdError::Empty));
        assert_eq!(ModelId::parse("openai:"), Err(ModelIdError::Empty));
    }

    #[test]
    fn parse_splits_provider_and_name() {
        let id = ModelId::parse("openai:gpt-4").unwrap();
        assert_eq!(id.provider.as_deref(), Some("openai"));
        assert_eq!(id.name, "gpt-4");

        let bare = ModelId::parse("gpt4").unwrap();
        assert_eq!(bare.provider, None);
        assert_eq!(bare.name, "gpt4");
    }

    #[test]
    fn lookup_resolves_alias_and_returns_known_descriptor() {
        let catalog = catalog();
        let id = ModelId::parse("gpt4").unwrap();
        let descriptor = catalog.lookup(&id);
        assert!(descriptor.known);
        assert_eq!(descriptor.context_window, Some(128_000));
        assert_eq!(descriptor.max_output_tokens, Some(4_096));
    }

    #[test]
    fn lookup_miss_returns_unknown_sentinel() {
        let catalog = catalog();
        let id = ModelId::parse("openai:does-not-exist").unwrap();
        let descriptor = catalog.lookup(&id);
        assert!(!descriptor.known);
        assert_eq!(descriptor.context_window, None);
    }
}

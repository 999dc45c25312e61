mod catalog;
mod spec;

use indexmap::IndexMap;

use crate::request::GenerationKind;

pub use spec::{
    AuthScheme, ExtractionRules, HttpMethod, PayloadShape, ProviderSpec, StatusClass,
    StatusVocabulary, SubmitRoute, DEFAULT_ERROR_PATHS, DEFAULT_TASK_ID_PATHS,
};

/// Static catalog of providers, keyed by id in registration order.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: IndexMap<String, ProviderSpec>,
}

impl ProviderRegistry {
    pub fn new(providers: Option<IndexMap<String, ProviderSpec>>) -> Self {
        Self {
            providers: providers.unwrap_or_else(catalog::default_providers),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.providers.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn by_kind(&self, kind: GenerationKind) -> Vec<&ProviderSpec> {
        self.providers
            .values()
            .filter(|spec| spec.supports(kind))
            .collect()
    }

    pub fn ensure(&self, id: &str, kind: GenerationKind) -> Option<&ProviderSpec> {
        self.get(id).filter(|spec| spec.supports(kind))
    }

    /// Points a provider at another API base (proxy, staging, mock server).
    /// Returns `false` when the id is unknown.
    pub fn set_api_base(&mut self, id: &str, api_base: &str) -> bool {
        let Some(spec) = self.providers.get_mut(id) else {
            return false;
        };
        spec.api_base = api_base.trim().trim_end_matches('/').to_string();
        true
    }
}

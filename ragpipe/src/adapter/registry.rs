//! Adapter registry.
//!
//! Maps `(capability, name)` to a constructor function, populated at
//! process start. Graph building resolves every stage's module binding
//! through the registry, so an unknown binding fails before anything runs.

use super::builtin::{
    ChunkAdapter, ExtractiveGenerator, HashEmbedder, IndexAdapter, LexicalEvaluator,
    PassthroughLoader, VectorRetriever,
};
use super::{Capability, ModuleAdapter, StageSettings};
use crate::errors::EngineError;
use crate::stores::VectorStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Constructor for one registered adapter.
///
/// Receives the stage's resolved settings so a constructor can pick a model
/// name, collection, or credential source before the first invocation.
pub type AdapterConstructor =
    Arc<dyn Fn(&StageSettings) -> Result<Arc<dyn ModuleAdapter>, EngineError> + Send + Sync>;

/// Registry of available module adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    constructors: HashMap<(Capability, String), AdapterConstructor>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-populated with the built-in adapters, wired
    /// to the given vector store.
    #[must_use]
    pub fn with_builtins(store: Arc<dyn VectorStore>) -> Self {
        let mut registry = Self::new();

        registry.register(Capability::Loader, "passthrough", |_settings| {
            Ok(Arc::new(PassthroughLoader::new()) as Arc<dyn ModuleAdapter>)
        });
        registry.register(Capability::Embedder, "hash", |_settings| {
            Ok(Arc::new(HashEmbedder::new()) as Arc<dyn ModuleAdapter>)
        });
        registry.register(Capability::Generator, "extractive", |_settings| {
            Ok(Arc::new(ExtractiveGenerator::new()) as Arc<dyn ModuleAdapter>)
        });
        registry.register(Capability::Evaluator, "lexical", |_settings| {
            Ok(Arc::new(LexicalEvaluator::new()) as Arc<dyn ModuleAdapter>)
        });
        registry.register(Capability::Custom, "chunk", |_settings| {
            Ok(Arc::new(ChunkAdapter::new()) as Arc<dyn ModuleAdapter>)
        });

        let retriever_store = store.clone();
        registry.register(Capability::Retriever, "vector", move |_settings| {
            Ok(Arc::new(VectorRetriever::new(retriever_store.clone())) as Arc<dyn ModuleAdapter>)
        });

        let index_store = store;
        registry.register(Capability::Custom, "index", move |_settings| {
            Ok(Arc::new(IndexAdapter::new(index_store.clone())) as Arc<dyn ModuleAdapter>)
        });

        registry
    }

    /// Registers a constructor under `(capability, name)`.
    ///
    /// A later registration under the same key replaces the earlier one.
    pub fn register<F>(&mut self, capability: Capability, name: impl Into<String>, ctor: F)
    where
        F: Fn(&StageSettings) -> Result<Arc<dyn ModuleAdapter>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert((capability, name.into()), Arc::new(ctor));
    }

    /// Returns whether a constructor is registered under `(capability, name)`.
    #[must_use]
    pub fn contains(&self, capability: Capability, name: &str) -> bool {
        self.constructors
            .contains_key(&(capability, name.to_string()))
    }

    /// Constructs the adapter registered under `(capability, name)`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown binding or a failing constructor.
    pub fn construct(
        &self,
        capability: Capability,
        name: &str,
        settings: &StageSettings,
    ) -> Result<Arc<dyn ModuleAdapter>, EngineError> {
        let ctor = self
            .constructors
            .get(&(capability, name.to_string()))
            .ok_or_else(|| {
                EngineError::Adapter(format!("no adapter registered for {capability}/{name}"))
            })?;
        ctor(settings)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .constructors
            .keys()
            .map(|(capability, name)| format!("{capability}/{name}"))
            .collect();
        keys.sort();
        f.debug_struct("AdapterRegistry")
            .field("registered", &keys)
            .finish()
    }
}

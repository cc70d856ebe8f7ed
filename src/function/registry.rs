use std::collections::BTreeMap;
use tracing::debug;

use super::StepFunction;
use crate::error::{PrecisError, Result};
use crate::logging::{operations, services};

/// A named group of step functions
#[derive(Debug, Clone)]
pub struct FunctionSource {
    name: String,
    functions: BTreeMap<String, StepFunction>,
}

impl FunctionSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            functions: BTreeMap::new(),
        }
    }

    /// Builder-style [`FunctionSource::register`]
    pub fn with(mut self, function: StepFunction) -> Self {
        self.register(function);
        self
    }

    /// Add a function; a later function with the same name replaces it
    pub fn register(&mut self, function: StepFunction) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<&StepFunction> {
        self.functions.get(name)
    }
}

/// A function together with the source it was found in
#[derive(Debug, Clone)]
pub struct ResolvedFunction {
    /// `source.function`, hashed into cache keys
    pub canonical_name: String,
    pub function: StepFunction,
}

/// Ordered set of function sources
///
/// Simple names are looked up in every source in registration order; the
/// first match wins. `source.function` only looks in that source.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    sources: Vec<FunctionSource>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, source: FunctionSource) {
        debug!(
            service = services::BATCH,
            operation = operations::REGISTER,
            source = source.name(),
            functions = source.functions.len(),
            "registered function source"
        );
        self.sources.push(source);
    }

    pub fn with_source(mut self, source: FunctionSource) -> Self {
        self.register_source(source);
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Resolve a step's function reference
    pub fn resolve(&self, reference: &str) -> Result<ResolvedFunction> {
        let qualified = reference.rsplit_once('.').and_then(|(source, name)| {
            self.sources
                .iter()
                .any(|s| s.name() == source)
                .then_some((source, name))
        });

        let found = match qualified {
            Some((source_name, name)) => self
                .sources
                .iter()
                .filter(|s| s.name() == source_name)
                .find_map(|s| s.get(name).map(|f| (s, f))),
            None => self
                .sources
                .iter()
                .find_map(|s| s.get(reference).map(|f| (s, f))),
        };

        match found {
            Some((source, function)) => Ok(ResolvedFunction {
                canonical_name: format!("{}.{}", source.name(), function.name()),
                function: function.clone(),
            }),
            None => Err(PrecisError::config(format!(
                "function '{}' not found; searched sources: [{}]",
                reference,
                self.source_names().join(", ")
            ))),
        }
    }
}

//! Static mapping from language+version to the container image that runs it.

use crate::core_types::RuntimeEnvironment;
use crate::errors::OrchestratorError;

#[derive(Debug, Clone)]
pub struct RuntimeCatalog {
    runtimes: Vec<RuntimeEnvironment>,
}

impl RuntimeCatalog {
    pub fn new(runtimes: Vec<RuntimeEnvironment>) -> Self {
        Self { runtimes }
    }

    /// Resolve a language (or alias) and optional version.
    ///
    /// Without a version the entry flagged `default` wins, else the first
    /// declared entry for that language.
    pub fn resolve(
        &self,
        language: &str,
        version: Option<&str>,
    ) -> Result<RuntimeEnvironment, OrchestratorError> {
        let language = language.trim();
        let mut candidates = self
            .runtimes
            .iter()
            .filter(|runtime| runtime.matches_language(language));

        let found = match version.map(str::trim).filter(|v| !v.is_empty()) {
            Some(version) => candidates.find(|runtime| runtime.version == version),
            None => {
                let candidates: Vec<_> = candidates.collect();
                candidates
                    .iter()
                    .find(|runtime| runtime.default)
                    .or_else(|| candidates.first())
                    .copied()
            }
        };

        found.cloned().ok_or_else(|| OrchestratorError::UnsupportedRuntime {
            language: language.to_string(),
            version: version.map(str::to_string),
        })
    }

    pub fn list(&self) -> &[RuntimeEnvironment] {
        &self.runtimes
    }
}

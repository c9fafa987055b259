//! Configuration module for the orchestrator
//!
//! YAML configuration describing the runtime catalog, resource ceilings,
//! reaper cadence and Docker client behaviour.

pub mod types;
pub mod loader;

pub use types::*;
pub use loader::*;


use crate::errors::OrchestratorError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandcastleConfig, OrchestratorError> {
    ConfigLoader::from_file(path).await
}

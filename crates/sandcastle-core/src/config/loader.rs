//! Configuration loader for YAML files and environment overrides

use crate::config::types::*;
use crate::errors::OrchestratorError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const WORKSPACE_ROOT_ENV: &str = "SANDCASTLE_WORKSPACE_ROOT";
pub const LOG_LEVEL_ENV: &str = "SANDCASTLE_LOG_LEVEL";

/// Configuration loader with environment resolution
pub struct ConfigLoader;
impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandcastleConfig, OrchestratorError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_str(&content)?;

        // Relative workspace roots are anchored at the config file's directory
        if config.workspace.root.is_relative() {
            if let Some(base_dir) = path.parent() {
                config.workspace.root = base_dir.join(&config.workspace.root);
            }
        }

        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandcastleConfig, OrchestratorError> {
        let mut config: SandcastleConfig = if content.trim().is_empty() {
            SandcastleConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                OrchestratorError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::resolve_environment(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Load from a file when one is given, otherwise start from defaults.
    pub async fn from_optional_file(
        path: Option<&Path>,
    ) -> Result<SandcastleConfig, OrchestratorError> {
        match path {
            Some(path) => Self::from_file(path).await,
            None => Self::from_str(""),
        }
    }

    fn resolve_environment(config: &mut SandcastleConfig) {
        if let Ok(root) = env::var(WORKSPACE_ROOT_ENV) {
            if !root.is_empty() {
                log::debug!("Workspace root overridden by {}: {}", WORKSPACE_ROOT_ENV, root);
                config.workspace.root = PathBuf::from(root);
            }
        }
        if let Ok(level) = env::var(LOG_LEVEL_ENV) {
            if !level.is_empty() {
                config.logging.level = level;
            }
        }
    }
}

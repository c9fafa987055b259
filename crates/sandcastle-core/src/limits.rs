//! Translation of a logical request into concrete container constraints.

use crate::config::LimitsConfig;
use crate::core_types::{ExecutionRequest, ResourceLimits, RuntimeEnvironment};
use crate::errors::OrchestratorError;

#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    config: LimitsConfig,
}

impl ResourceLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        Self { config }
    }

    /// Clamp requested limits to the process-wide maxima.
    pub fn derive(
        &self,
        request: &ExecutionRequest,
        environment: &RuntimeEnvironment,
    ) -> Result<ResourceLimits, OrchestratorError> {
        let timeout_seconds = match request.timeout {
            Some(seconds) if seconds <= 0 => {
                return Err(OrchestratorError::InvalidResourceRequest(format!(
                    "timeout must be positive, got {}",
                    seconds
                )))
            }
            Some(seconds) => (seconds as u64).min(self.config.max_timeout_secs),
            None => self.config.default_timeout_secs,
        };

        let memory_bytes = match request.memory_bytes {
            Some(bytes) if bytes <= 0 => {
                return Err(OrchestratorError::InvalidResourceRequest(format!(
                    "memory must be positive, got {}",
                    bytes
                )))
            }
            Some(bytes) => bytes,
            None => environment
                .memory_bytes
                .unwrap_or(self.config.default_memory_bytes),
        }
        .min(self.config.max_memory_bytes);

        Ok(ResourceLimits {
            memory_bytes,
            cpu_shares: self.config.cpu_shares,
            timeout_seconds,
        })
    }
}

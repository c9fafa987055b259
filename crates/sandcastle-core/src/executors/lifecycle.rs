//! Container lifecycle management on top of a `ContainerRuntime`.
//!
//! Every call is bounded by a per-call timeout that is independent of the
//! execution's own deadline. Fetching a missing image is a separate step with
//! its own, longer bound. Transient failures during create/start are
//! retried with exponential backoff before surfacing. Stop and remove treat
//! "already stopped" and "already gone" as success so that the reaper and an
//! explicit deletion can race without either one failing.

use super::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::config::DockerConfig;
use crate::core_types::{ContainerHandle, WorkdirMount};
use crate::errors::{OrchestratorError, RuntimeCallError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub call_timeout: Duration,
    pub pull_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl From<&DockerConfig> for LifecyclePolicy {
    fn from(config: &DockerConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            pull_timeout: Duration::from_secs(config.pull_timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from(&DockerConfig::default())
    }
}

impl LifecyclePolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Worst-case time one retried call bounded by `call_timeout` may take.
    fn retried(&self, call_timeout: Duration) -> Duration {
        let backoff = (0..self.max_retries)
            .map(|attempt| self.backoff(attempt))
            .fold(Duration::ZERO, Duration::saturating_add);
        call_timeout
            .saturating_mul(self.max_retries.saturating_add(1))
            .saturating_add(backoff)
    }

    /// Worst-case time image resolution, create and start may take
    /// together, retries included.
    pub fn startup_budget(&self) -> Duration {
        self.retried(self.pull_timeout)
            .saturating_add(self.retried(self.call_timeout).saturating_mul(2))
    }
}

#[derive(Clone)]
pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    policy: LifecyclePolicy,
}

impl ContainerLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: LifecyclePolicy) -> Self {
        Self { runtime, policy }
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        target: &str,
        call_timeout: Duration,
        mut call: F,
    ) -> Result<T, RuntimeCallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RuntimeCallError>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeCallError::Transient(format!(
                    "{} timed out after {:?}",
                    operation, call_timeout
                ))),
            };

            match outcome {
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let backoff = self.policy.backoff(attempt);
                    attempt += 1;
                    log::warn!(
                        "{} of {} failed ({}), retry {}/{} in {:?}",
                        operation,
                        target,
                        e,
                        attempt,
                        self.policy.max_retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    /// Make `image` available locally, fetching it if needed. Bounded by
    /// `pull_timeout` rather than the per-call timeout.
    pub async fn ensure_image(&self, image: &str) -> Result<(), OrchestratorError> {
        let result = self
            .call_with_retry("pull", image, self.policy.pull_timeout, || {
                self.runtime.ensure_image(image)
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(RuntimeCallError::Transient(message)) => {
                Err(OrchestratorError::RuntimeUnavailable(message))
            }
            Err(e) => Err(OrchestratorError::ContainerCreateError(format!(
                "image {} unavailable: {}",
                image, e
            ))),
        }
    }

    /// Fetch the image if needed, then allocate a container for `spec`.
    pub async fn create(
        &self,
        spec: &ContainerSpec,
        workdir: WorkdirMount,
    ) -> Result<ContainerHandle, OrchestratorError> {
        self.ensure_image(&spec.image).await?;

        let result = self
            .call_with_retry("create", &spec.name, self.policy.call_timeout, || {
                self.runtime.create(spec)
            })
            .await;

        let id = match result {
            Ok(id) => id,
            // A retried create whose first attempt did reach the daemon.
            // Names embed the execution id, so the existing container is ours.
            Err(RuntimeCallError::Conflict(message)) => {
                log::warn!(
                    "Container name {} already in use ({}), adopting existing container",
                    spec.name,
                    message
                );
                spec.name.clone()
            }
            Err(RuntimeCallError::Transient(message)) => {
                return Err(OrchestratorError::RuntimeUnavailable(message))
            }
            Err(RuntimeCallError::NotFound(message)) => {
                return Err(OrchestratorError::ContainerCreateError(format!(
                    "image {} not found: {}",
                    spec.image, message
                )))
            }
            Err(e) => return Err(OrchestratorError::ContainerCreateError(e.to_string())),
        };

        log::debug!("Created container {} ({})", spec.name, id);
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            limits: spec.limits,
            ports: Vec::new(),
            workdir,
        })
    }

    pub async fn start(&self, handle: &ContainerHandle) -> Result<(), OrchestratorError> {
        let result = self
            .call_with_retry("start", &handle.id, self.policy.call_timeout, || {
                self.runtime.start(&handle.id)
            })
            .await;

        match result {
            Ok(()) | Err(RuntimeCallError::NotModified) => {
                log::debug!("Started container {}", handle.id);
                Ok(())
            }
            Err(RuntimeCallError::Transient(message)) => {
                Err(OrchestratorError::RuntimeUnavailable(message))
            }
            Err(e) => Err(OrchestratorError::ContainerStartError(e.to_string())),
        }
    }

    /// Single non-blocking poll of the container's state.
    pub async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeCallError> {
        match tokio::time::timeout(self.policy.call_timeout, self.runtime.inspect(&handle.id)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeCallError::Transient(format!(
                "inspect timed out after {:?}",
                self.policy.call_timeout
            ))),
        }
    }

    /// Graceful stop, escalating to a kill if the stop call itself fails.
    /// Stopping a container that is already stopped or gone is a no-op.
    pub async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeCallError> {
        let result = self
            .call_with_retry("stop", &handle.id, grace + self.policy.call_timeout, || {
                self.runtime.stop(&handle.id, grace)
            })
            .await;

        match result {
            Ok(()) | Err(RuntimeCallError::NotModified) | Err(RuntimeCallError::NotFound(_)) => {
                log::debug!("Stopped container {}", handle.id);
                Ok(())
            }
            Err(e) => {
                log::warn!("Stop of {} failed ({}), killing", handle.id, e);
                let killed = self
                    .call_with_retry("kill", &handle.id, self.policy.call_timeout, || {
                        self.runtime.kill(&handle.id)
                    })
                    .await;
                match killed {
                    // 409: container is not running
                    Ok(())
                    | Err(RuntimeCallError::NotFound(_))
                    | Err(RuntimeCallError::Conflict(_))
                    | Err(RuntimeCallError::NotModified) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Delete the container object. Removing a container that no longer
    /// exists is a no-op.
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeCallError> {
        let result = self
            .call_with_retry("remove", &handle.id, self.policy.call_timeout, || {
                self.runtime.remove(&handle.id)
            })
            .await;

        match result {
            Ok(()) | Err(RuntimeCallError::NotFound(_)) => {
                log::debug!("Removed container {}", handle.id);
                Ok(())
            }
            // Removal already in progress elsewhere
            Err(RuntimeCallError::Conflict(message)) if message.contains("in progress") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

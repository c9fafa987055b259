//! Public facade tying the components together.
//!
//! `execute` does all validation up front (runtime, limits, source) so that
//! a bad request never reaches the container daemon, then creates and starts
//! the container, registers it and returns without waiting for the code to
//! finish. Everything after that point is observed through the tracker:
//! status and logs by the caller, deadlines and exit codes by the reaper.
//!
//! The orchestrator owns the reaper task. It must be constructed inside a
//! Tokio runtime, and dropping it stops the reaper without touching
//! containers; call [`Orchestrator::shutdown`] to also cancel and remove
//! everything still running.

use crate::catalog::RuntimeCatalog;
use crate::config::SandcastleConfig;
use crate::core_types::{
    ContainerInfo, ExecutionLog, ExecutionRecord, ExecutionRequest, ExecutionResponse,
    ExecutionSource, ExecutionStatus, ExecutionStatusReport, RuntimeEnvironment, StreamType,
    WorkdirMount,
};
use crate::errors::OrchestratorError;
use crate::executors::{
    ContainerLifecycle, ContainerRuntime, ContainerSpec, DockerRuntime, LifecyclePolicy,
};
use crate::limits::ResourceLimiter;
use crate::logs::{LogCollector, LogStream};
use crate::reaper::{Reaper, ReaperSettings};
use crate::tracker::{ExecutionTracker, NewExecution};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FILE_PLACEHOLDER: &str = "{file}";
const MANAGED_LABEL: &str = "sandcastle.managed";
const EXECUTION_LABEL: &str = "sandcastle.execution_id";
const RUNTIME_LABEL: &str = "sandcastle.runtime";
const PROJECT_LABEL: &str = "sandcastle.project_id";

/// Host directory to mount and the file the entry command runs.
struct PreparedSource {
    host_path: PathBuf,
    file: Option<String>,
    scratch: Option<TempDir>,
}

pub struct Orchestrator {
    config: SandcastleConfig,
    catalog: RuntimeCatalog,
    limiter: ResourceLimiter,
    lifecycle: ContainerLifecycle,
    tracker: Arc<ExecutionTracker>,
    collector: LogCollector,
    reaper: Arc<Reaper>,
    shutdown: CancellationToken,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator over an injected container runtime and start
    /// its reaper.
    pub fn new(
        config: SandcastleConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let tracker = Arc::new(ExecutionTracker::with_log_limit(config.limits.max_log_bytes));
        let lifecycle = ContainerLifecycle::new(runtime.clone(), LifecyclePolicy::from(&config.docker));
        let collector = LogCollector::new(runtime, tracker.clone());
        let reaper = Arc::new(Reaper::new(
            tracker.clone(),
            lifecycle.clone(),
            ReaperSettings::from(&config.reaper),
        ));

        let shutdown = CancellationToken::new();
        let reaper_task = reaper.clone().spawn(shutdown.clone());

        let catalog = RuntimeCatalog::new(config.effective_runtimes());
        log::info!(
            "Orchestrator ready with {} runtimes, workspace root {}",
            catalog.list().len(),
            config.workspace.root.display()
        );

        Ok(Self {
            catalog,
            limiter: ResourceLimiter::new(config.limits.clone()),
            lifecycle,
            tracker,
            collector,
            reaper,
            shutdown,
            reaper_task: Mutex::new(Some(reaper_task)),
            config,
        })
    }

    /// Docker-backed orchestrator. Fails with `RuntimeUnavailable` if the
    /// daemon does not answer a ping.
    pub async fn connect(config: SandcastleConfig) -> Result<Self, OrchestratorError> {
        let docker = DockerRuntime::connect()?;
        let call_timeout = Duration::from_secs(config.docker.call_timeout_secs);
        match tokio::time::timeout(call_timeout, docker.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(OrchestratorError::RuntimeUnavailable(format!(
                    "Docker daemon did not answer ping: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(OrchestratorError::RuntimeUnavailable(format!(
                    "Docker daemon ping timed out after {:?}",
                    call_timeout
                )))
            }
        }
        Self::new(config, Arc::new(docker))
    }

    pub fn config(&self) -> &SandcastleConfig {
        &self.config
    }

    pub fn catalog(&self) -> &RuntimeCatalog {
        &self.catalog
    }

    /// Submit code for execution and return its id once the container is
    /// running. Does not wait for the code to finish.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<String, OrchestratorError> {
        let environment = self
            .catalog
            .resolve(&request.language, request.version.as_deref())?;
        let limits = self.limiter.derive(&request, &environment)?;
        let env = environment_list(&request.environment_vars)?;
        let source = self.prepare_source(&request, &environment).await?;
        let command = build_command(&environment, request.command.as_deref(), source.file.as_deref())?;

        let timeout = Duration::from_secs(limits.timeout_seconds);
        let execution_id = self.tracker.submit(NewExecution {
            execution_id: None,
            project_id: request.project_id().map(str::to_string),
            runtime_id: environment.id.clone(),
            // The clock restarts once the container runs; until then the
            // budget covers every create/start attempt as well.
            deadline: deadline_after(timeout.saturating_add(self.lifecycle.policy().startup_budget())),
            scratch: source.scratch,
        })?;
        log::info!(
            "Execution {} submitted: runtime {}, timeout {}s, memory {} bytes",
            execution_id,
            environment.id,
            limits.timeout_seconds,
            limits.memory_bytes
        );

        let mount = WorkdirMount {
            host_path: source.host_path,
            container_path: self.config.workspace.mount_path.clone(),
        };
        let mut labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (EXECUTION_LABEL.to_string(), execution_id.clone()),
            (RUNTIME_LABEL.to_string(), environment.id.clone()),
        ]);
        if let Some(project_id) = request.project_id() {
            labels.insert(PROJECT_LABEL.to_string(), project_id.to_string());
        }
        let spec = ContainerSpec {
            name: format!("{}-{}", self.config.docker.container_prefix, execution_id),
            image: environment.image.clone(),
            command,
            working_dir: mount.container_path.clone(),
            volumes: vec![format!("{}:{}", mount.host_path.display(), mount.container_path)],
            env,
            limits,
            network_disabled: self.config.docker.network_disabled,
            publish_ports: self.config.docker.publish_ports,
            labels,
        };

        let handle = match self.lifecycle.create(&spec, mount).await {
            Ok(handle) => handle,
            Err(e) => {
                self.abandon(&execution_id, &e);
                return Err(e);
            }
        };

        if let Err(e) = self.tracker.attach_container(&execution_id, handle.clone()) {
            // Deleted while the container was being created
            if let Err(remove_error) = self.lifecycle.remove(&handle).await {
                log::warn!("Could not remove orphaned container {}: {}", handle.id, remove_error);
            }
            return Err(e);
        }
        if self.tracker.status(&execution_id)?.is_terminal() {
            log::info!("Execution {} ended before its container started", execution_id);
            self.tracker.close_log(&execution_id)?;
            return Ok(execution_id);
        }

        if let Err(e) = self.lifecycle.start(&handle).await {
            self.abandon(&execution_id, &e);
            return Err(e);
        }

        self.tracker
            .set_deadline(&execution_id, deadline_after(timeout))?;
        match self
            .tracker
            .transition(&execution_id, ExecutionStatus::Running, None)
        {
            Ok(()) => {}
            // Cancelled while starting; the reaper removes the container
            Err(OrchestratorError::InvalidTransition { .. }) => {
                self.tracker.close_log(&execution_id)?;
                return Ok(execution_id);
            }
            Err(e) => {
                if let Err(remove_error) = self.lifecycle.remove(&handle).await {
                    log::warn!("Could not remove orphaned container {}: {}", handle.id, remove_error);
                }
                return Err(e);
            }
        }

        if self.config.docker.publish_ports {
            match self.lifecycle.inspect(&handle).await {
                Ok(state) => self.tracker.set_ports(&execution_id, state.ports)?,
                Err(e) => log::warn!("Could not read published ports of {}: {}", handle.id, e),
            }
        }

        self.collector.attach(&execution_id, &handle)?;
        Ok(execution_id)
    }

    /// Record a failed submission. The caller never learns its id, so the
    /// record is evicted as soon as any container it owns is removed.
    fn abandon(&self, execution_id: &str, error: &OrchestratorError) {
        log::warn!("Execution {} failed to start: {}", execution_id, error);
        match self.tracker.transition_with_reason(
            execution_id,
            ExecutionStatus::Failed,
            None,
            error.to_string(),
        ) {
            Ok(()) => {}
            // Cancelled or deleted while starting; already terminal
            Err(OrchestratorError::InvalidTransition { .. }) => {}
            Err(e) => log::warn!("Could not mark execution {} as failed: {}", execution_id, e),
        }
        if let Err(e) = self.tracker.close_log(execution_id) {
            log::warn!("Could not close log of execution {}: {}", execution_id, e);
        }
        if let Err(e) = self.tracker.mark_deleted(execution_id) {
            log::warn!("Could not release execution {}: {}", execution_id, e);
        }
    }

    async fn prepare_source(
        &self,
        request: &ExecutionRequest,
        environment: &RuntimeEnvironment,
    ) -> Result<PreparedSource, OrchestratorError> {
        match &request.source {
            ExecutionSource::Project { project_id } => {
                validate_path_component("project id", project_id)?;
                let path = self.config.workspace.root.join(project_id);
                let metadata = tokio::fs::metadata(&path).await.map_err(|_| {
                    OrchestratorError::InvalidSource(format!(
                        "project '{}' not found under {}",
                        project_id,
                        self.config.workspace.root.display()
                    ))
                })?;
                if !metadata.is_dir() {
                    return Err(OrchestratorError::InvalidSource(format!(
                        "project '{}' is not a directory",
                        project_id
                    )));
                }
                Ok(PreparedSource {
                    host_path: tokio::fs::canonicalize(&path).await?,
                    file: environment.default_file.clone(),
                    scratch: None,
                })
            }
            ExecutionSource::Inline { filename, code } => {
                validate_path_component("filename", filename)?;
                if !environment.accepts_file(filename) {
                    return Err(OrchestratorError::InvalidSource(format!(
                        "'{}' is not a {} source file (expected {})",
                        filename,
                        environment.name,
                        environment.extensions.join(", ")
                    )));
                }
                let scratch = tempfile::Builder::new().prefix("sandcastle-").tempdir()?;
                tokio::fs::write(scratch.path().join(filename), code).await?;
                Ok(PreparedSource {
                    host_path: scratch.path().to_path_buf(),
                    file: Some(filename.clone()),
                    scratch: Some(scratch),
                })
            }
        }
    }

    pub fn status(&self, execution_id: &str) -> Result<ExecutionStatusReport, OrchestratorError> {
        Ok(ExecutionStatusReport {
            execution_id: execution_id.to_string(),
            status: self.tracker.status(execution_id)?,
        })
    }

    /// Log entries with `sequence >= since`.
    pub fn logs(
        &self,
        execution_id: &str,
        since: Option<u64>,
    ) -> Result<ExecutionLog, OrchestratorError> {
        self.tracker.logs_since(execution_id, since)
    }

    /// Live log sequence from `since`; ends when the log is closed.
    pub fn log_stream(
        &self,
        execution_id: &str,
        since: Option<u64>,
    ) -> Result<LogStream, OrchestratorError> {
        self.collector.subscribe(execution_id, since)
    }

    pub fn record(&self, execution_id: &str) -> Result<ExecutionRecord, OrchestratorError> {
        self.tracker.get(execution_id)
    }

    /// Cancel a PENDING or RUNNING execution. CANCELLED is recorded before
    /// the container is stopped, so an exit observed afterwards cannot
    /// overwrite it.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        self.tracker.transition_with_reason(
            execution_id,
            ExecutionStatus::Cancelled,
            None,
            "cancelled by request",
        )?;

        let record = self.tracker.get(execution_id)?;
        if let Some(handle) = record.container {
            if let Err(e) = self
                .lifecycle
                .stop(&handle, self.reaper.settings().stop_grace)
                .await
            {
                // Removal is forced, so the reaper still gets rid of it
                log::warn!("Stop of cancelled container {} failed: {}", handle.id, e);
            }
        }
        Ok(())
    }

    /// Suspend until the execution reaches a terminal status.
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionStatus, OrchestratorError> {
        self.tracker.wait_terminal(execution_id).await
    }

    pub fn response(&self, execution_id: &str) -> Result<ExecutionResponse, OrchestratorError> {
        let record = self.tracker.get(execution_id)?;
        let log = ExecutionLog {
            execution_id: record.execution_id.clone(),
            logs: record.logs,
        };
        let stdout = log.text(StreamType::Stdout);
        let stderr = log.text(StreamType::Stderr);

        let error: Vec<String> = record
            .error
            .into_iter()
            .chain(Some(stderr).filter(|s| !s.is_empty()))
            .collect();

        Ok(ExecutionResponse {
            execution_id: record.execution_id,
            status: record.status,
            output: Some(stdout).filter(|s| !s.is_empty()),
            error: if error.is_empty() { None } else { Some(error.join("\n")) },
            exit_code: record.exit_code,
            start_time: record.start_time,
            end_time: record.end_time,
        })
    }

    pub fn container_info(&self, execution_id: &str) -> Result<ContainerInfo, OrchestratorError> {
        let record = self.tracker.get(execution_id)?;
        container_info(record)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Every tracked execution whose container still exists.
    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.tracker
            .snapshots()
            .into_iter()
            .filter(|record| !record.container_removed)
            .filter_map(container_info)
            .collect()
    }

    /// Cancel if still active, remove the container and forget the record.
    /// Safe to race with the reaper.
    pub async fn delete(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        if !self.tracker.status(execution_id)?.is_terminal() {
            match self.cancel(execution_id).await {
                Ok(()) | Err(OrchestratorError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let record = self.tracker.get(execution_id)?;
        if let Some(handle) = record.container.filter(|_| !record.container_removed) {
            if let Err(e) = self.lifecycle.remove(&handle).await {
                log::warn!(
                    "Removal of container {} failed, deferring deletion of {}: {}",
                    handle.id,
                    execution_id,
                    e
                );
                return self.tracker.mark_deleted(execution_id);
            }
            self.tracker.mark_container_removed(execution_id)?;
        }

        self.tracker.evict(execution_id);
        log::info!("Deleted execution {}", execution_id);
        Ok(())
    }

    /// Stop the reaper, cancel every active execution and remove all
    /// containers still owned by tracked executions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let reaper_task = self
            .reaper_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = reaper_task {
            if let Err(e) = task.await {
                log::warn!("Reaper task ended abnormally: {}", e);
            }
        }

        let active = self.tracker.list_active();
        if !active.is_empty() {
            log::info!("Cancelling {} active executions", active.len());
        }
        futures_util::future::join_all(active.iter().map(|id| async move {
            if let Err(e) = self.cancel(id).await {
                log::debug!("Cancel of {} during shutdown: {}", id, e);
            }
        }))
        .await;

        let pending = self.tracker.list_pending_cleanup(Duration::ZERO);
        let results =
            futures_util::future::join_all(pending.iter().map(|id| self.reaper.cleanup(id))).await;
        let leftover = results.iter().filter(|removed| !**removed).count();
        if leftover > 0 {
            log::warn!("{} containers could not be removed during shutdown", leftover);
        }
        log::info!("Orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn container_info(record: ExecutionRecord) -> Option<ContainerInfo> {
    let container = record.container?;
    Some(ContainerInfo {
        container_id: container.id,
        project_id: record.project_id,
        status: record.status,
        created_at: record.start_time,
        ports: if container.ports.is_empty() {
            None
        } else {
            Some(container.ports)
        },
    })
}

/// Reject anything that could escape the directory it is joined onto.
fn validate_path_component(what: &str, value: &str) -> Result<(), OrchestratorError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
        || Path::new(value).is_absolute();
    if invalid {
        return Err(OrchestratorError::InvalidSource(format!(
            "invalid {} '{}'",
            what, value
        )));
    }
    Ok(())
}

/// Container command: `sh -c <override>`, or the entry command with the
/// file placeholder filled in.
fn build_command(
    environment: &RuntimeEnvironment,
    command: Option<&str>,
    file: Option<&str>,
) -> Result<Vec<String>, OrchestratorError> {
    if let Some(command) = command {
        if command.trim().is_empty() {
            return Err(OrchestratorError::InvalidSource(
                "command cannot be empty".to_string(),
            ));
        }
        return Ok(vec!["sh".to_string(), "-c".to_string(), command.to_string()]);
    }

    environment
        .entry_command
        .iter()
        .map(|part| match (part.contains(FILE_PLACEHOLDER), file) {
            (false, _) => Ok(part.clone()),
            (true, Some(file)) => Ok(part.replace(FILE_PLACEHOLDER, file)),
            (true, None) => Err(OrchestratorError::InvalidSource(format!(
                "runtime {} has no default file; pass a command",
                environment.id
            ))),
        })
        .collect()
}

/// `KEY=VALUE` pairs in a stable order.
fn environment_list(vars: &HashMap<String, String>) -> Result<Vec<String>, OrchestratorError> {
    let mut env = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(OrchestratorError::InvalidResourceRequest(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        env.push(format!("{}={}", key, value));
    }
    env.sort();
    Ok(env)
}

/// `now + budget`, clamped where the clock cannot represent the sum.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_runtimes;

    fn python() -> RuntimeEnvironment {
        builtin_runtimes()
            .into_iter()
            .find(|r| r.id == "python-3.12")
            .unwrap()
    }

    #[test]
    fn test_entry_command_placeholder() {
        let command = build_command(&python(), None, Some("job.py")).unwrap();
        assert_eq!(command, vec!["python", "-u", "job.py"]);
    }

    #[test]
    fn test_command_override_runs_in_shell() {
        let command = build_command(&python(), Some("pip list && python main.py"), None).unwrap();
        assert_eq!(command, vec!["sh", "-c", "pip list && python main.py"]);
        assert!(build_command(&python(), Some("  "), None).is_err());
    }

    #[test]
    fn test_placeholder_without_file_is_rejected() {
        let mut runtime = python();
        runtime.default_file = None;
        assert!(matches!(
            build_command(&runtime, None, None),
            Err(OrchestratorError::InvalidSource(_))
        ));
    }

    #[test]
    fn test_path_components() {
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "/abs"] {
            assert!(validate_path_component("project id", bad).is_err(), "{}", bad);
        }
        for good in ["demo", "my-project_2", "..hidden"] {
            assert!(validate_path_component("project id", good).is_ok(), "{}", good);
        }
    }

    #[test]
    fn test_environment_list_sorted_and_validated() {
        let vars = HashMap::from([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "x=y".to_string()),
        ]);
        assert_eq!(environment_list(&vars).unwrap(), vec!["A=x=y", "B=2"]);

        let bad = HashMap::from([("A=B".to_string(), "1".to_string())]);
        assert!(matches!(
            environment_list(&bad),
            Err(OrchestratorError::InvalidResourceRequest(_))
        ));
    }

    #[test]
    fn test_deadline_after_saturated_budget_is_far_future() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(100 * 365 * 24 * 60 * 60));
        assert!(deadline_after(Duration::from_secs(5)) <= Instant::now() + Duration::from_secs(5));
    }
}

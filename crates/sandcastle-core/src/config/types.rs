//! Configuration type definitions for the orchestrator
//!
//! Every section is optional in YAML and falls back to the defaults below, so
//! an empty document yields a working configuration backed by the built-in
//! runtime catalog.

use crate::core_types::RuntimeEnvironment;
use crate::errors::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Ceilings on configured durations and retry counts. Deadlines are computed
/// as `Instant + duration`, which must not overflow.
const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_RETRIES: u32 = 10;
const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandcastleConfig {
    #[serde(default)]
    pub runtimes: Vec<RuntimeEnvironment>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Process-wide resource ceilings and the defaults applied when a request
/// leaves a limit unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_memory_bytes")]
    pub default_memory_bytes: i64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: i64,
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: i64,
    /// Output kept per execution; later output is dropped behind a marker.
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Upper bound for a single create/start/stop/remove call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Upper bound for fetching a missing image, which can take far longer
    /// than any other call.
    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub network_disabled: bool,
    #[serde(default)]
    pub publish_ports: bool,
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_timeout_secs() -> u64 { 30 }
fn default_max_timeout_secs() -> u64 { 300 }
fn default_memory_bytes() -> i64 { 256 * 1024 * 1024 }
fn default_max_memory_bytes() -> i64 { 1024 * 1024 * 1024 }
fn default_cpu_shares() -> i64 { 512 }
fn default_max_log_bytes() -> usize { 8 * 1024 * 1024 }
fn default_reaper_interval_ms() -> u64 { 500 }
fn default_stop_grace_secs() -> u64 { 2 }
fn default_retention_secs() -> u64 { 600 }
fn default_call_timeout_secs() -> u64 { 30 }
fn default_pull_timeout_secs() -> u64 { 600 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_true() -> bool { true }
fn default_container_prefix() -> String { "sandcastle".to_string() }
fn default_workspace_root() -> PathBuf { PathBuf::from("./projects") }
fn default_mount_path() -> String { "/workspace".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            default_memory_bytes: default_memory_bytes(),
            max_memory_bytes: default_max_memory_bytes(),
            cpu_shares: default_cpu_shares(),
            max_log_bytes: default_max_log_bytes(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_reaper_interval_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            pull_timeout_secs: default_pull_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            network_disabled: true,
            publish_ports: false,
            container_prefix: default_container_prefix(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            mount_path: default_mount_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn runtime(
    language: &str,
    version: &str,
    name: &str,
    image: &str,
    entry_command: &[&str],
    extensions: &[&str],
    aliases: &[&str],
    default_file: &str,
    default: bool,
) -> RuntimeEnvironment {
    RuntimeEnvironment {
        id: format!("{}-{}", language, version),
        name: name.to_string(),
        language: language.to_string(),
        version: version.to_string(),
        image: image.to_string(),
        entry_command: entry_command.iter().map(|s| s.to_string()).collect(),
        extensions: extensions.iter().map(|s| s.to_string()).collect(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        default_file: Some(default_file.to_string()),
        memory_bytes: None,
        default,
    }
}

/// Catalog used when the configuration declares no runtimes.
pub fn builtin_runtimes() -> Vec<RuntimeEnvironment> {
    vec![
        runtime("python", "3.12", "Python 3.12", "python:3.12-slim", &["python", "-u", "{file}"], &["py"], &["py", "python3"], "main.py", true),
        runtime("python", "3.11", "Python 3.11", "python:3.11-slim", &["python", "-u", "{file}"], &["py"], &["py", "python3"], "main.py", false),
        runtime("node", "20", "Node.js 20", "node:20-slim", &["node", "{file}"], &["js", "mjs", "cjs"], &["javascript", "js", "nodejs"], "index.js", true),
        runtime("node", "18", "Node.js 18", "node:18-slim", &["node", "{file}"], &["js", "mjs", "cjs"], &["javascript", "js", "nodejs"], "index.js", false),
        runtime("bash", "5", "Bash 5", "bash:5", &["bash", "{file}"], &["sh", "bash"], &["sh", "shell"], "main.sh", true),
        runtime("go", "1.22", "Go 1.22", "golang:1.22-alpine", &["go", "run", "{file}"], &["go"], &["golang"], "main.go", true),
        runtime("ruby", "3.3", "Ruby 3.3", "ruby:3.3-slim", &["ruby", "{file}"], &["rb"], &["rb"], "main.rb", true),
    ]
}

impl SandcastleConfig {
    /// Runtimes from the configuration, or the built-in catalog if none.
    pub fn effective_runtimes(&self) -> Vec<RuntimeEnvironment> {
        if self.runtimes.is_empty() {
            builtin_runtimes()
        } else {
            self.runtimes.clone()
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut seen = HashSet::new();
        for runtime in &self.runtimes {
            if runtime.id.is_empty() {
                return Err(OrchestratorError::ConfigError(
                    "Runtime id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(runtime.id.to_lowercase()) {
                return Err(OrchestratorError::ConfigError(format!(
                    "Duplicate runtime id '{}'",
                    runtime.id
                )));
            }
            if runtime.language.is_empty() {
                return Err(OrchestratorError::ConfigError(format!(
                    "Runtime '{}' language cannot be empty",
                    runtime.id
                )));
            }
            if runtime.image.is_empty() {
                return Err(OrchestratorError::ConfigError(format!(
                    "Runtime '{}' image cannot be empty",
                    runtime.id
                )));
            }
            if runtime.entry_command.is_empty() {
                return Err(OrchestratorError::ConfigError(format!(
                    "Runtime '{}' entry_command cannot be empty",
                    runtime.id
                )));
            }
            if matches!(runtime.memory_bytes, Some(bytes) if bytes <= 0) {
                return Err(OrchestratorError::ConfigError(format!(
                    "Runtime '{}' memory_bytes must be greater than 0",
                    runtime.id
                )));
            }
        }

        let limits = &self.limits;
        if limits.max_timeout_secs == 0 || limits.default_timeout_secs == 0 {
            return Err(OrchestratorError::ConfigError(
                "Timeouts must be greater than 0".to_string(),
            ));
        }
        if limits.default_timeout_secs > limits.max_timeout_secs {
            return Err(OrchestratorError::ConfigError(format!(
                "default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                limits.default_timeout_secs, limits.max_timeout_secs
            )));
        }
        if limits.default_memory_bytes <= 0 || limits.max_memory_bytes <= 0 {
            return Err(OrchestratorError::ConfigError(
                "Memory limits must be greater than 0".to_string(),
            ));
        }
        if limits.default_memory_bytes > limits.max_memory_bytes {
            return Err(OrchestratorError::ConfigError(format!(
                "default_memory_bytes ({}) exceeds max_memory_bytes ({})",
                limits.default_memory_bytes, limits.max_memory_bytes
            )));
        }
        if limits.cpu_shares <= 0 {
            return Err(OrchestratorError::ConfigError(
                "cpu_shares must be greater than 0".to_string(),
            ));
        }

        if limits.max_log_bytes == 0 {
            return Err(OrchestratorError::ConfigError(
                "max_log_bytes must be greater than 0".to_string(),
            ));
        }

        if self.reaper.interval_ms == 0 {
            return Err(OrchestratorError::ConfigError(
                "Reaper interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.docker.call_timeout_secs == 0 || self.docker.pull_timeout_secs == 0 {
            return Err(OrchestratorError::ConfigError(
                "Docker call_timeout_secs and pull_timeout_secs must be greater than 0".to_string(),
            ));
        }
        for (name, secs) in [
            ("limits.max_timeout_secs", limits.max_timeout_secs),
            ("reaper.stop_grace_secs", self.reaper.stop_grace_secs),
            ("reaper.retention_secs", self.reaper.retention_secs),
            ("reaper.interval_ms", self.reaper.interval_ms / 1000),
            ("docker.call_timeout_secs", self.docker.call_timeout_secs),
            ("docker.pull_timeout_secs", self.docker.pull_timeout_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(OrchestratorError::ConfigError(format!(
                    "{} exceeds the ceiling of {}s",
                    name, MAX_DURATION_SECS
                )));
            }
        }
        if self.docker.max_retries > MAX_RETRIES {
            return Err(OrchestratorError::ConfigError(format!(
                "docker.max_retries ({}) exceeds the ceiling of {}",
                self.docker.max_retries, MAX_RETRIES
            )));
        }
        if self.docker.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(OrchestratorError::ConfigError(format!(
                "docker.retry_backoff_ms ({}) exceeds the ceiling of {}",
                self.docker.retry_backoff_ms, MAX_RETRY_BACKOFF_MS
            )));
        }
        if self.docker.container_prefix.is_empty() {
            return Err(OrchestratorError::ConfigError(
                "Docker container_prefix cannot be empty".to_string(),
            ));
        }
        if !self.workspace.mount_path.starts_with('/') {
            return Err(OrchestratorError::ConfigError(format!(
                "Workspace mount_path '{}' must be absolute",
                self.workspace.mount_path
            )));
        }

        Ok(())
    }
}

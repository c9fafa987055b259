//! Core record definitions shared by every orchestrator component
//!
//! These types are the contract with the surrounding system: collaborators
//! submit `ExecutionRequest`s and read back `ExecutionResponse`,
//! `ExecutionLog`, `ExecutionStatusReport` and `ContainerInfo` records. The
//! internal `ExecutionRecord` lives in the tracker and is only ever handed out
//! as a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }

    /// Edges of the execution state machine. Terminal states have none.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            // Creation/start failures and cancellation before start
            (Pending, Failed) | (Pending, Cancelled) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, TimedOut) | (Running, Cancelled) => {
                true
            }
            _ => false,
        }
    }

    /// Terminal status for a container that exited on its own.
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// One chunk of container output. Sequence numbers are assigned by the
/// tracker, start at zero and are strictly increasing per execution.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: u64,
    pub stream: StreamType,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionLog {
    pub execution_id: String,
    pub logs: Vec<LogEntry>,
}

impl ExecutionLog {
    /// Concatenated text of one stream, in arrival order.
    pub fn text(&self, stream: StreamType) -> String {
        self.logs
            .iter()
            .filter(|entry| entry.stream == stream)
            .map(|entry| entry.text.as_str())
            .collect()
    }

    /// Sequence number a consumer should resume from after this slice.
    pub fn next_sequence(&self) -> Option<u64> {
        self.logs.last().map(|entry| entry.sequence + 1)
    }
}

/// Where the code to run comes from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionSource {
    /// A project directory under the configured workspace root.
    Project { project_id: String },
    /// A single source file supplied with the request.
    Inline { filename: String, code: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionRequest {
    pub language: String,
    #[serde(default)]
    pub version: Option<String>,
    pub source: ExecutionSource,
    #[serde(default)]
    pub command: Option<String>,
    /// Requested wall-clock limit in seconds. Signed so that nonsensical
    /// caller input can be rejected instead of wrapping.
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
}

impl ExecutionRequest {
    pub fn project(language: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::new(
            language,
            ExecutionSource::Project {
                project_id: project_id.into(),
            },
        )
    }

    pub fn inline(
        language: impl Into<String>,
        filename: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::new(
            language,
            ExecutionSource::Inline {
                filename: filename.into(),
                code: code.into(),
            },
        )
    }

    fn new(language: impl Into<String>, source: ExecutionSource) -> Self {
        Self {
            language: language.into(),
            version: None,
            source,
            command: None,
            timeout: None,
            memory_bytes: None,
            environment_vars: HashMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_memory(mut self, bytes: i64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_vars.insert(key.into(), value.into());
        self
    }

    pub fn project_id(&self) -> Option<&str> {
        match &self.source {
            ExecutionSource::Project { project_id } => Some(project_id),
            ExecutionSource::Inline { .. } => None,
        }
    }
}

/// A runtime language+version and the container image that provides it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    pub id: String,
    pub name: String,
    pub language: String,
    pub version: String,
    pub image: String,
    /// May contain `{file}`, replaced by the file being run.
    pub entry_command: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub default_file: Option<String>,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub default: bool,
}

impl RuntimeEnvironment {
    pub fn accepts_file(&self, filename: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    pub fn matches_language(&self, language: &str) -> bool {
        self.language.eq_ignore_ascii_case(language)
            || self.id.eq_ignore_ascii_case(language)
            || self
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(language))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: String,
    pub host_port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkdirMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// The orchestrator's reference to one container. Owned by exactly one
/// execution record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub limits: ResourceLimits,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    pub workdir: WorkdirMount,
}

/// Read-only snapshot of a tracked execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub project_id: Option<String>,
    pub runtime_id: String,
    pub container: Option<ContainerHandle>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub deadline: tokio::time::Instant,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub log_closed: bool,
    pub container_removed: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ExecutionStatusReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContainerInfo {
    pub container_id: String,
    pub project_id: Option<String>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortMapping>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        use ExecutionStatus::*;
        let all = [Pending, Running, Succeeded, Failed, TimedOut, Cancelled];
        for from in [Succeeded, Failed, TimedOut, Cancelled] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(TimedOut));
        assert!(Running.can_transition_to(TimedOut));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
        assert_eq!(ExecutionStatus::TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn test_accepts_file_extension() {
        let runtime = RuntimeEnvironment {
            id: "python-3.12".to_string(),
            name: "Python 3.12".to_string(),
            language: "python".to_string(),
            version: "3.12".to_string(),
            image: "python:3.12-slim".to_string(),
            entry_command: vec!["python".to_string(), "{file}".to_string()],
            extensions: vec![".py".to_string()],
            aliases: vec!["py".to_string()],
            default_file: Some("main.py".to_string()),
            memory_bytes: None,
            default: true,
        };
        assert!(runtime.accepts_file("main.py"));
        assert!(runtime.accepts_file("MAIN.PY"));
        assert!(!runtime.accepts_file("main.js"));
        assert!(!runtime.accepts_file(".py"));
        assert!(!runtime.accepts_file("Makefile"));
        assert!(runtime.matches_language("PY"));
        assert!(runtime.matches_language("python-3.12"));
    }

    #[test]
    fn test_log_text_by_stream() {
        let log = ExecutionLog {
            execution_id: "e".to_string(),
            logs: vec![
                LogEntry { sequence: 0, stream: StreamType::Stdout, text: "a".to_string() },
                LogEntry { sequence: 1, stream: StreamType::Stderr, text: "x".to_string() },
                LogEntry { sequence: 2, stream: StreamType::Stdout, text: "b".to_string() },
            ],
        };
        assert_eq!(log.text(StreamType::Stdout), "ab");
        assert_eq!(log.text(StreamType::Stderr), "x");
        assert_eq!(log.next_sequence(), Some(3));
    }
}

//! In-process registry of executions.
//!
//! The tracker is the only state shared between the orchestrator, the log
//! collectors and the reaper, and it is only reachable through the methods
//! below. The id → record map is behind a read/write lock that is held just
//! long enough to clone a slot pointer; each record then has its own mutex,
//! so work on one execution never waits on another. A `watch` channel per
//! record is bumped after every mutation so log consumers and `wait_terminal`
//! can suspend without polling.

use crate::core_types::{
    ContainerHandle, ExecutionLog, ExecutionRecord, ExecutionStatus, LogEntry, PortMapping,
    StreamType,
};
use crate::errors::OrchestratorError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Parameters for a new PENDING record.
#[derive(Debug)]
pub struct NewExecution {
    /// Generated when `None`.
    pub execution_id: Option<String>,
    pub project_id: Option<String>,
    pub runtime_id: String,
    pub deadline: Instant,
    /// Scratch directory that must outlive the container.
    pub scratch: Option<TempDir>,
}

#[derive(Debug)]
struct RecordState {
    execution_id: String,
    project_id: Option<String>,
    runtime_id: String,
    container: Option<ContainerHandle>,
    status: ExecutionStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    terminal_at: Option<Instant>,
    deadline: Instant,
    exit_code: Option<i64>,
    error: Option<String>,
    logs: Vec<LogEntry>,
    log_bytes: usize,
    log_truncated: bool,
    log_closed: bool,
    container_removed: bool,
    deleted: bool,
    _scratch: Option<TempDir>,
}

impl RecordState {
    fn snapshot(&self) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id.clone(),
            project_id: self.project_id.clone(),
            runtime_id: self.runtime_id.clone(),
            container: self.container.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            deadline: self.deadline,
            exit_code: self.exit_code,
            error: self.error.clone(),
            logs: self.logs.clone(),
            log_closed: self.log_closed,
            container_removed: self.container_removed,
        }
    }

    fn needs_cleanup(&self) -> bool {
        self.status.is_terminal() && self.container.is_some() && !self.container_removed
    }
}

#[derive(Debug)]
struct Slot {
    state: Mutex<RecordState>,
    version: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, RecordState> {
        // A panic while holding the lock cannot leave a record half-written:
        // every mutation is a handful of field assignments.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Change notifications for one record, used by log streams and waiters.
#[derive(Debug)]
pub struct RecordWatch {
    slot: Arc<Slot>,
    rx: watch::Receiver<u64>,
}

impl RecordWatch {
    /// Mark the current version as seen. Call before reading so that any
    /// later mutation wakes `changed`.
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Entries with `sequence >= from`, and whether the log is closed.
    pub fn entries_from(&self, from: u64) -> (Vec<LogEntry>, bool) {
        let state = self.slot.lock();
        let start = (from as usize).min(state.logs.len());
        (state.logs[start..].to_vec(), state.log_closed)
    }

    pub fn status(&self) -> ExecutionStatus {
        self.slot.lock().status
    }

    /// Suspend until the record changes. Never errors while the watch
    /// holds the slot, since the slot owns the sender.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[derive(Debug)]
pub struct ExecutionTracker {
    records: RwLock<HashMap<String, Arc<Slot>>>,
    max_log_bytes: usize,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::with_log_limit(usize::MAX)
    }
}

impl ExecutionTracker {
    /// Tracker with no bound on buffered output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that keeps at most `max_log_bytes` of output per execution.
    pub fn with_log_limit(max_log_bytes: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_log_bytes,
        }
    }

    fn slot(&self, execution_id: &str) -> Result<Arc<Slot>, OrchestratorError> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    fn slots(&self) -> Vec<Arc<Slot>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Insert a new PENDING record.
    pub fn submit(&self, new: NewExecution) -> Result<String, OrchestratorError> {
        let execution_id = new
            .execution_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if records.contains_key(&execution_id) {
            return Err(OrchestratorError::DuplicateExecution(execution_id));
        }

        let (version, _) = watch::channel(0);
        let slot = Slot {
            state: Mutex::new(RecordState {
                execution_id: execution_id.clone(),
                project_id: new.project_id,
                runtime_id: new.runtime_id,
                container: None,
                status: ExecutionStatus::Pending,
                start_time: Utc::now(),
                end_time: None,
                terminal_at: None,
                deadline: new.deadline,
                exit_code: None,
                error: None,
                logs: Vec::new(),
                log_bytes: 0,
                log_truncated: false,
                log_closed: false,
                container_removed: false,
                deleted: false,
                _scratch: new.scratch,
            }),
            version,
            cancel: CancellationToken::new(),
        };
        records.insert(execution_id.clone(), Arc::new(slot));
        log::debug!("Registered execution {}", execution_id);
        Ok(execution_id)
    }

    pub fn transition(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        exit_code: Option<i64>,
    ) -> Result<(), OrchestratorError> {
        self.apply_transition(execution_id, status, exit_code, None)
    }

    /// Transition and record why, e.g. a container start failure.
    pub fn transition_with_reason(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        exit_code: Option<i64>,
        reason: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        self.apply_transition(execution_id, status, exit_code, Some(reason.into()))
    }

    fn apply_transition(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        exit_code: Option<i64>,
        reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let slot = self.slot(execution_id)?;
        {
            let mut state = slot.lock();
            if !state.status.can_transition_to(status) {
                return Err(OrchestratorError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    from: state.status,
                    to: status,
                });
            }
            log::info!("Execution {}: {} -> {}", execution_id, state.status, status);
            state.status = status;
            if exit_code.is_some() {
                state.exit_code = exit_code;
            }
            if reason.is_some() {
                state.error = reason;
            }
            if status.is_terminal() {
                state.end_time = Some(Utc::now());
                state.terminal_at = Some(Instant::now());
            }
        }
        slot.bump();
        Ok(())
    }

    pub fn get(&self, execution_id: &str) -> Result<ExecutionRecord, OrchestratorError> {
        Ok(self.slot(execution_id)?.lock().snapshot())
    }

    pub fn status(&self, execution_id: &str) -> Result<ExecutionStatus, OrchestratorError> {
        Ok(self.slot(execution_id)?.lock().status)
    }

    /// Ids of all non-terminal executions at the time of the call.
    pub fn list_active(&self) -> Vec<String> {
        self.slots()
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                (!state.status.is_terminal()).then(|| state.execution_id.clone())
            })
            .collect()
    }

    /// Terminal executions whose container has not been removed yet and
    /// whose log has closed, or has had `drain_grace` to do so.
    pub fn list_pending_cleanup(&self, drain_grace: Duration) -> Vec<String> {
        let now = Instant::now();
        self.slots()
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                let drained = state.log_closed
                    || state
                        .terminal_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= drain_grace);
                (state.needs_cleanup() && drained).then(|| state.execution_id.clone())
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self.slots().iter().map(|slot| slot.lock().snapshot()).collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        records
    }

    /// Bind the execution's single container handle.
    pub fn attach_container(
        &self,
        execution_id: &str,
        handle: ContainerHandle,
    ) -> Result<(), OrchestratorError> {
        let slot = self.slot(execution_id)?;
        {
            let mut state = slot.lock();
            if let Some(existing) = &state.container {
                return Err(OrchestratorError::ContainerCreateError(format!(
                    "execution {} already owns container {}",
                    execution_id, existing.id
                )));
            }
            state.container = Some(handle);
        }
        slot.bump();
        Ok(())
    }

    /// Move the deadline, e.g. to start the clock once the container runs.
    pub fn set_deadline(&self, execution_id: &str, deadline: Instant) -> Result<(), OrchestratorError> {
        let slot = self.slot(execution_id)?;
        slot.lock().deadline = deadline;
        slot.bump();
        Ok(())
    }

    pub fn set_ports(
        &self,
        execution_id: &str,
        ports: Vec<PortMapping>,
    ) -> Result<(), OrchestratorError> {
        let slot = self.slot(execution_id)?;
        if let Some(container) = slot.lock().container.as_mut() {
            container.ports = ports;
        }
        Ok(())
    }

    /// Append one output chunk and return its sequence number.
    ///
    /// Once the buffered output would exceed the log limit a single
    /// truncation marker is stored in place of the chunk, and every later
    /// chunk is dropped with `Ok(None)`.
    pub fn append_log(
        &self,
        execution_id: &str,
        stream: StreamType,
        text: String,
    ) -> Result<Option<u64>, OrchestratorError> {
        let slot = self.slot(execution_id)?;
        let sequence = {
            let mut state = slot.lock();
            // Closed logs are immutable, same as terminal statuses
            if state.log_closed {
                return Err(OrchestratorError::InvalidTransition {
                    execution_id: execution_id.to_string(),
                    from: state.status,
                    to: state.status,
                });
            }
            if state.log_truncated {
                return Ok(None);
            }
            let sequence = state.logs.len() as u64;
            if state.log_bytes.saturating_add(text.len()) > self.max_log_bytes {
                state.log_truncated = true;
                log::warn!(
                    "Execution {} exceeded {} bytes of output, dropping the rest",
                    execution_id,
                    self.max_log_bytes
                );
                let log_bytes = state.log_bytes;
                state.logs.push(LogEntry {
                    sequence,
                    stream: StreamType::Stderr,
                    text: format!("[output truncated after {} bytes]\n", log_bytes),
                });
            } else {
                state.log_bytes += text.len();
                state.logs.push(LogEntry {
                    sequence,
                    stream,
                    text,
                });
            }
            sequence
        };
        slot.bump();
        Ok(Some(sequence))
    }

    /// Mark the log complete; consumers drain what is buffered and end.
    pub fn close_log(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let slot = self.slot(execution_id)?;
        slot.lock().log_closed = true;
        slot.bump();
        Ok(())
    }

    /// Log entries with `sequence >= since`.
    pub fn logs_since(
        &self,
        execution_id: &str,
        since: Option<u64>,
    ) -> Result<ExecutionLog, OrchestratorError> {
        let slot = self.slot(execution_id)?;
        let state = slot.lock();
        let start = (since.unwrap_or(0) as usize).min(state.logs.len());
        Ok(ExecutionLog {
            execution_id: execution_id.to_string(),
            logs: state.logs[start..].to_vec(),
        })
    }

    pub fn mark_container_removed(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let slot = self.slot(execution_id)?;
        slot.lock().container_removed = true;
        slot.bump();
        Ok(())
    }

    /// Flag the record for eviction as soon as its container is gone.
    pub fn mark_deleted(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        self.slot(execution_id)?.lock().deleted = true;
        Ok(())
    }

    /// The execution's cancellation signal. Cancelled on eviction.
    pub fn cancel_token(&self, execution_id: &str) -> Result<CancellationToken, OrchestratorError> {
        Ok(self.slot(execution_id)?.cancel.clone())
    }

    pub fn watch(&self, execution_id: &str) -> Result<RecordWatch, OrchestratorError> {
        let slot = self.slot(execution_id)?;
        let rx = slot.version.subscribe();
        Ok(RecordWatch { slot, rx })
    }

    /// Suspend until the execution reaches a terminal status.
    pub async fn wait_terminal(&self, execution_id: &str) -> Result<ExecutionStatus, OrchestratorError> {
        let mut watch = self.watch(execution_id)?;
        loop {
            watch.mark_seen();
            let status = watch.status();
            if status.is_terminal() {
                return Ok(status);
            }
            if !watch.changed().await {
                return Err(OrchestratorError::ExecutionNotFound(execution_id.to_string()));
            }
        }
    }

    /// Remove a record. Any log consumer sees the stream close.
    pub fn evict(&self, execution_id: &str) -> bool {
        let removed = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(execution_id);
        match removed {
            Some(slot) => {
                slot.cancel.cancel();
                slot.lock().log_closed = true;
                slot.bump();
                log::debug!("Evicted execution {}", execution_id);
                true
            }
            None => false,
        }
    }

    /// Evict terminal, cleaned-up records older than `retention`, and
    /// deleted ones immediately. Returns the evicted ids.
    pub fn evict_expired(&self, retention: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .slots()
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                let terminal_at = state.terminal_at?;
                if state.needs_cleanup() {
                    return None;
                }
                let aged = now.saturating_duration_since(terminal_at) >= retention;
                (aged || state.deleted).then(|| state.execution_id.clone())
            })
            .collect();

        expired
            .into_iter()
            .filter(|execution_id| self.evict(execution_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

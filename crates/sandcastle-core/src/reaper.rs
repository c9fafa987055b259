//! Background enforcement of deadlines and container cleanup.
//!
//! Status decisions that need only the clock are made inside the cycle
//! itself: a RUNNING execution past its deadline is marked TIMED_OUT there,
//! and so is a PENDING one whose starter went away. Everything that talks to
//! the container runtime (inspect, stop, remove) runs on a task of its own,
//! at most one per execution at a time, so a slow or hung call only ever
//! delays the execution it belongs to. A cycle waits for its tasks for at
//! most one interval; stragglers finish in the background.
//!
//! Terminal executions whose container still exists are removed once their
//! log has drained or the stop grace period has passed. A failed removal is
//! retried on a later cycle and never changes the execution's status.

use crate::config::ReaperConfig;
use crate::core_types::{ContainerHandle, ExecutionRecord, ExecutionStatus};
use crate::errors::{OrchestratorError, RuntimeCallError};
use crate::executors::ContainerLifecycle;
use crate::tracker::ExecutionTracker;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub stop_grace: Duration,
    pub retention: Duration,
}

impl From<&ReaperConfig> for ReaperSettings {
    fn from(config: &ReaperConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            retention: Duration::from_secs(config.retention_secs),
        }
    }
}

/// What one cycle did; used for logging and tests. Work still in flight
/// when the cycle ends is not reported.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub finalized: Vec<String>,
    pub timed_out: Vec<String>,
    pub removed: Vec<String>,
    pub cleanup_failures: Vec<String>,
    pub evicted: Vec<String>,
}

impl ReapReport {
    fn is_empty(&self) -> bool {
        self.finalized.is_empty()
            && self.timed_out.is_empty()
            && self.removed.is_empty()
            && self.cleanup_failures.is_empty()
            && self.evicted.is_empty()
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Idle => {}
            Outcome::Finalized(id) => self.finalized.push(id),
            Outcome::Removed(id) => self.removed.push(id),
            Outcome::CleanupFailed(id) => self.cleanup_failures.push(id),
        }
    }
}

enum Outcome {
    Idle,
    Finalized(String),
    Removed(String),
    CleanupFailed(String),
}

/// Runtime work for one execution.
enum Job {
    /// Look for an exit.
    Inspect(ExecutionRecord),
    /// Terminate a container whose execution already timed out.
    Stop(ContainerHandle),
    Remove,
}

pub struct Reaper {
    tracker: Arc<ExecutionTracker>,
    lifecycle: ContainerLifecycle,
    settings: ReaperSettings,
    in_flight: Mutex<HashSet<String>>,
}

/// An execution's claim on the reaper; released when its task ends, even
/// if the task panics.
struct Claim {
    reaper: Arc<Reaper>,
    execution_id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.reaper.in_flight().remove(&self.execution_id);
    }
}

impl Reaper {
    pub fn new(
        tracker: Arc<ExecutionTracker>,
        lifecycle: ContainerLifecycle,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            tracker,
            lifecycle,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> ReaperSettings {
        self.settings
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run cycles every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!("Reaper started, interval {:?}", self.settings.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.run_cycle().await;
                        if !report.is_empty() {
                            log::debug!("Reaper cycle: {:?}", report);
                        }
                    }
                }
            }
            log::debug!("Reaper stopped");
        })
    }

    /// One pass over all executions. Returns after at most one interval.
    pub async fn run_cycle(self: &Arc<Self>) -> ReapReport {
        let mut report = ReapReport::default();
        let mut jobs = Vec::new();
        let now = Instant::now();

        for execution_id in self.tracker.list_active() {
            let record = match self.tracker.get(&execution_id) {
                Ok(record) => record,
                Err(_) => continue,
            };
            match record.status {
                ExecutionStatus::Running if now >= record.deadline => {
                    if self.time_out(&record) {
                        report.timed_out.push(execution_id.clone());
                        if let Some(handle) = record.container {
                            jobs.extend(self.dispatch(execution_id, Job::Stop(handle)));
                        }
                    }
                }
                ExecutionStatus::Running => {
                    jobs.extend(self.dispatch(execution_id, Job::Inspect(record)));
                }
                // The submitting call owns a PENDING record until its deadline
                // plus the grace period; past that the caller went away mid-start.
                ExecutionStatus::Pending
                    if record
                        .deadline
                        .checked_add(self.settings.stop_grace)
                        .is_some_and(|limit| now >= limit) =>
                {
                    if self.fail_abandoned(&execution_id) {
                        report.finalized.push(execution_id);
                    }
                }
                _ => {}
            }
        }

        // A container whose stop could not be handed off this cycle is still
        // killed by the forced removal.
        for execution_id in self.tracker.list_pending_cleanup(self.settings.stop_grace) {
            jobs.extend(self.dispatch(execution_id, Job::Remove));
        }

        self.collect(jobs, &mut report).await;
        report.evicted = self.tracker.evict_expired(self.settings.retention);
        report
    }

    /// Start `job` on its own task unless the execution already has one.
    fn dispatch(self: &Arc<Self>, execution_id: String, job: Job) -> Option<JoinHandle<Outcome>> {
        if !self.in_flight().insert(execution_id.clone()) {
            log::debug!("Reaper work for {} still in flight, skipping", execution_id);
            return None;
        }
        let claim = Claim {
            reaper: self.clone(),
            execution_id,
        };

        Some(tokio::spawn(async move {
            let reaper = claim.reaper.clone();
            let execution_id = claim.execution_id.clone();
            let outcome = match job {
                Job::Inspect(record) => reaper.observe(record).await,
                Job::Stop(handle) => {
                    if let Err(e) = reaper.lifecycle.stop(&handle, reaper.settings.stop_grace).await {
                        log::warn!("Stop of timed out container {} failed: {}", handle.id, e);
                    }
                    Outcome::Idle
                }
                Job::Remove => {
                    if reaper.cleanup(&execution_id).await {
                        Outcome::Removed(execution_id)
                    } else {
                        Outcome::CleanupFailed(execution_id)
                    }
                }
            };
            drop(claim);
            outcome
        }))
    }

    /// Wait for this cycle's tasks, for at most one interval.
    async fn collect(&self, jobs: Vec<JoinHandle<Outcome>>, report: &mut ReapReport) {
        let mut pending: FuturesUnordered<_> = jobs.into_iter().collect();
        let budget = tokio::time::sleep(self.settings.interval);
        tokio::pin!(budget);

        while !pending.is_empty() {
            tokio::select! {
                joined = pending.next() => match joined {
                    Some(Ok(outcome)) => report.record(outcome),
                    Some(Err(e)) => log::warn!("Reaper task ended abnormally: {}", e),
                    None => break,
                },
                _ = &mut budget => {
                    log::debug!(
                        "{} reaper tasks still running after {:?}",
                        pending.len(),
                        self.settings.interval
                    );
                    break;
                }
            }
        }
    }

    /// Mark a RUNNING execution past its deadline as TIMED_OUT. Returns
    /// false if something else finalized it first.
    fn time_out(&self, record: &ExecutionRecord) -> bool {
        let timeout_seconds = record
            .container
            .as_ref()
            .map(|handle| handle.limits.timeout_seconds)
            .unwrap_or_default();
        match self.tracker.transition_with_reason(
            &record.execution_id,
            ExecutionStatus::TimedOut,
            None,
            format!("execution exceeded its {}s time limit", timeout_seconds),
        ) {
            Ok(()) => {
                log::info!("Execution {} timed out", record.execution_id);
                true
            }
            // A concurrent cancel or exit already wrote the terminal status
            Err(OrchestratorError::InvalidTransition { .. }) => false,
            Err(e) => {
                log::warn!("Reaper could not time out {}: {}", record.execution_id, e);
                false
            }
        }
    }

    fn fail_abandoned(&self, execution_id: &str) -> bool {
        let reason = "execution never started before its deadline";
        match self.tracker.transition_with_reason(
            execution_id,
            ExecutionStatus::Failed,
            None,
            reason,
        ) {
            Ok(()) => {
                log::warn!("Execution {}: {}", execution_id, reason);
                true
            }
            Err(_) => false,
        }
    }

    /// Finalize a RUNNING execution whose container has exited or vanished.
    async fn observe(&self, record: ExecutionRecord) -> Outcome {
        let execution_id = record.execution_id;
        let handle = match record.container {
            Some(handle) => handle,
            None => return Outcome::Idle,
        };

        let result = match self.lifecycle.inspect(&handle).await {
            Ok(state) if state.exited() => {
                let exit_code = state.exit_code.unwrap_or(-1);
                let status = ExecutionStatus::from_exit_code(exit_code);
                if state.oom_killed {
                    self.tracker.transition_with_reason(
                        &execution_id,
                        status,
                        Some(exit_code),
                        format!(
                            "container exceeded its memory limit of {} bytes",
                            handle.limits.memory_bytes
                        ),
                    )
                } else {
                    self.tracker.transition(&execution_id, status, Some(exit_code))
                }
            }
            Err(RuntimeCallError::NotFound(_)) => self.tracker.transition_with_reason(
                &execution_id,
                ExecutionStatus::Failed,
                None,
                format!("container {} disappeared", handle.id),
            ),
            Ok(_) => return Outcome::Idle,
            Err(e) => {
                log::warn!("Inspect of {} for {} failed: {}", handle.id, execution_id, e);
                return Outcome::Idle;
            }
        };

        match result {
            Ok(()) => Outcome::Finalized(execution_id),
            // Timed out or cancelled while the inspect was in flight
            Err(OrchestratorError::InvalidTransition { .. }) => Outcome::Idle,
            Err(e) => {
                log::warn!("Reaper could not finalize {}: {}", execution_id, e);
                Outcome::Idle
            }
        }
    }

    /// Remove the container of a terminal execution. Returns whether the
    /// container is gone.
    pub async fn cleanup(&self, execution_id: &str) -> bool {
        let record = match self.tracker.get(execution_id) {
            Ok(record) => record,
            Err(_) => return true,
        };
        let handle = match record.container {
            Some(handle) if !record.container_removed => handle,
            _ => return true,
        };

        match self.lifecycle.remove(&handle).await {
            Ok(()) => {
                let _ = self.tracker.mark_container_removed(execution_id);
                // The log stream ends with the container; make sure the
                // collector lets go even if the runtime never closed it.
                if let Ok(token) = self.tracker.cancel_token(execution_id) {
                    token.cancel();
                }
                log::info!(
                    "Removed container {} of execution {} ({})",
                    handle.id,
                    execution_id,
                    record.status
                );
                true
            }
            Err(e) => {
                log::warn!(
                    "Removal of container {} for {} failed, will retry: {}",
                    handle.id,
                    execution_id,
                    e
                );
                false
            }
        }
    }
}

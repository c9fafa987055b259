//! Container output collection and resumable log sequences.
//!
//! A collector task per execution pumps the runtime's follow-mode log stream
//! into the tracker's append-only buffer. Consumers never talk to the runtime:
//! they read the buffer through a cursor, so a consumer that disconnects can
//! resume from the last sequence it saw without gaps or duplicates.

use crate::core_types::{ContainerHandle, LogEntry};
use crate::errors::OrchestratorError;
use crate::executors::ContainerRuntime;
use crate::tracker::{ExecutionTracker, RecordWatch};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Lazy sequence of log entries that ends once the log is closed.
pub type LogStream = BoxStream<'static, LogEntry>;

#[derive(Clone)]
pub struct LogCollector {
    runtime: Arc<dyn ContainerRuntime>,
    tracker: Arc<ExecutionTracker>,
}

impl LogCollector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, tracker: Arc<ExecutionTracker>) -> Self {
        Self { runtime, tracker }
    }

    /// Start collecting output for `execution_id` from `handle`.
    ///
    /// The task ends when the container's output ends, when the runtime
    /// stream fails, or when the execution's cancellation token fires. In
    /// every case the runtime stream is dropped and the log is closed.
    pub fn attach(
        &self,
        execution_id: &str,
        handle: &ContainerHandle,
    ) -> Result<JoinHandle<()>, OrchestratorError> {
        let detach = self.tracker.cancel_token(execution_id)?;
        let mut output = self.runtime.logs(&handle.id);
        let tracker = self.tracker.clone();
        let execution_id = execution_id.to_string();
        let container_id = handle.id.clone();

        Ok(tokio::spawn(async move {
            let mut chunks = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = detach.cancelled() => {
                        log::debug!("Detached log collector for {}", execution_id);
                        break;
                    }
                    item = output.next() => match item {
                        Some(Ok(chunk)) => match tracker.append_log(&execution_id, chunk.stream, chunk.text) {
                            Ok(Some(_)) => chunks += 1,
                            // Over the log limit; keep draining so the
                            // stream ends with the container
                            Ok(None) => {}
                            Err(_) => break,
                        },
                        Some(Err(e)) => {
                            log::warn!(
                                "Log stream for container {} (execution {}) failed: {}",
                                container_id,
                                execution_id,
                                e
                            );
                            break;
                        }
                        None => break,
                    }
                }
            }
            drop(output);
            // Already evicted is fine
            let _ = tracker.close_log(&execution_id);
            log::debug!("Collected {} log chunks for {}", chunks, execution_id);
        }))
    }

    /// Release the collector's runtime stream for `execution_id`.
    pub fn detach(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        self.tracker.cancel_token(execution_id)?.cancel();
        Ok(())
    }

    /// Log entries from `since` onwards, suspending while waiting for more.
    pub fn subscribe(
        &self,
        execution_id: &str,
        since: Option<u64>,
    ) -> Result<LogStream, OrchestratorError> {
        let watch = self.tracker.watch(execution_id)?;
        Ok(follow(watch, since.unwrap_or(0)))
    }
}

struct Cursor {
    watch: RecordWatch,
    next: u64,
    pending: VecDeque<LogEntry>,
}

fn follow(watch: RecordWatch, from: u64) -> LogStream {
    let cursor = Cursor {
        watch,
        next: from,
        pending: VecDeque::new(),
    };

    stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(entry) = cursor.pending.pop_front() {
                return Some((entry, cursor));
            }

            cursor.watch.mark_seen();
            let (entries, closed) = cursor.watch.entries_from(cursor.next);
            if let Some(last) = entries.last() {
                cursor.next = last.sequence + 1;
                cursor.pending.extend(entries);
                continue;
            }
            if closed || !cursor.watch.changed().await {
                return None;
            }
        }
    })
    .boxed()
}

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use sandcastle_core::executors::{
    ContainerRuntime, ContainerSpec, ContainerState, LogChunk, LogChunkStream,
};
use sandcastle_core::{
    ExecutionRequest, ExecutionStatus, LogEntry, Orchestrator, OrchestratorError,
    RuntimeCallError, SandcastleConfig, StreamType,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One instruction of the toy shell the simulated containers run.
#[derive(Debug, Clone)]
enum Step {
    Out(String),
    Err(String),
    Sleep(Duration),
    Exit(i64),
}

fn parse_script(script: &str) -> Vec<Step> {
    script
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (op, arg) = line.split_once(' ').unwrap_or((line, ""));
            match op {
                "echo" => Step::Out(format!("{}\n", arg)),
                "echoerr" => Step::Err(format!("{}\n", arg)),
                "sleep" => Step::Sleep(Duration::from_secs(arg.parse().unwrap())),
                "exit" => Step::Exit(arg.parse().unwrap()),
                other => panic!("unknown instruction {}", other),
            }
        })
        .collect()
}

struct SimState {
    output: Vec<LogChunk>,
    running: bool,
    exit_code: Option<i64>,
    task: Option<JoinHandle<()>>,
}

struct SimContainer {
    spec: ContainerSpec,
    steps: Vec<Step>,
    state: Mutex<SimState>,
    changed: watch::Sender<u64>,
}

impl SimContainer {
    fn update(&self, f: impl FnOnce(&mut SimState)) {
        f(&mut self.state.lock().unwrap());
        self.changed.send_modify(|v| *v += 1);
    }

    fn finish(&self, exit_code: i64) {
        self.update(|state| {
            if state.running {
                state.running = false;
                state.exit_code = Some(exit_code);
            }
        });
    }

    /// Terminate the script as a signal would.
    fn terminate(&self) -> bool {
        let mut was_running = false;
        self.update(|state| {
            if let Some(task) = state.task.take() {
                task.abort();
            }
            if state.running {
                was_running = true;
                state.running = false;
                state.exit_code = Some(137);
            }
        });
        was_running
    }
}

/// In-memory stand-in for the Docker daemon. Containers run a script taken
/// from `sh -c` or from the mounted source file, on Tokio time.
#[derive(Default)]
struct SimRuntime {
    containers: Mutex<HashMap<String, Arc<SimContainer>>>,
    creates: AtomicUsize,
    removes: AtomicUsize,
    transient_create_failures: AtomicUsize,
    fail_start: AtomicBool,
    start_delay_ms: AtomicU64,
}

impl SimRuntime {
    fn container(&self, id: &str) -> Result<Arc<SimContainer>, RuntimeCallError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeCallError::NotFound(format!("No such container: {}", id)))
    }

    fn exists(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    fn count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn spec(&self, id: &str) -> ContainerSpec {
        self.container(id).unwrap().spec.clone()
    }

    fn script_for(spec: &ContainerSpec) -> Result<String, RuntimeCallError> {
        match spec.command.as_slice() {
            [sh, flag, script] if sh == "sh" && flag == "-c" => Ok(script.clone()),
            [.., file] => {
                let volume = spec.volumes.first().cloned().unwrap_or_default();
                let host = volume.split(':').next().unwrap_or_default().to_string();
                std::fs::read_to_string(Path::new(&host).join(file))
                    .map_err(|e| RuntimeCallError::Rejected(format!("cannot read {}: {}", file, e)))
            }
            [] => Err(RuntimeCallError::Rejected("empty command".to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for SimRuntime {
    async fn ping(&self) -> Result<(), RuntimeCallError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeCallError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RuntimeCallError::Transient("connection refused".to_string()));
        }

        let steps = parse_script(&Self::script_for(spec)?);
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeCallError::Conflict(format!("name {} in use", spec.name)));
        }
        let (changed, _) = watch::channel(0);
        containers.insert(
            spec.name.clone(),
            Arc::new(SimContainer {
                spec: spec.clone(),
                steps,
                state: Mutex::new(SimState {
                    output: Vec::new(),
                    running: false,
                    exit_code: None,
                    task: None,
                }),
                changed,
            }),
        );
        Ok(spec.name.clone())
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeCallError> {
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeCallError::Rejected("OCI runtime create failed".to_string()));
        }
        let container = self.container(container_id)?;
        {
            let state = container.state.lock().unwrap();
            if state.running || state.exit_code.is_some() {
                return Err(RuntimeCallError::NotModified);
            }
        }

        let script = container.clone();
        let task = tokio::spawn(async move {
            for step in script.steps.clone() {
                match step {
                    Step::Out(text) => script.update(|s| {
                        s.output.push(LogChunk { stream: StreamType::Stdout, text })
                    }),
                    Step::Err(text) => script.update(|s| {
                        s.output.push(LogChunk { stream: StreamType::Stderr, text })
                    }),
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Exit(code) => return script.finish(code),
                }
            }
            script.finish(0);
        });
        container.update(|state| {
            state.running = true;
            state.task = Some(task);
        });
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, RuntimeCallError> {
        let container = self.container(container_id)?;
        let state = container.state.lock().unwrap();
        Ok(ContainerState {
            running: state.running,
            exit_code: state.exit_code,
            oom_killed: false,
            ports: vec![],
        })
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), RuntimeCallError> {
        if self.container(container_id)?.terminate() {
            Ok(())
        } else {
            Err(RuntimeCallError::NotModified)
        }
    }

    async fn kill(&self, container_id: &str) -> Result<(), RuntimeCallError> {
        if self.container(container_id)?.terminate() {
            Ok(())
        } else {
            Err(RuntimeCallError::Conflict("container is not running".to_string()))
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeCallError> {
        let container = self
            .containers
            .lock()
            .unwrap()
            .remove(container_id)
            .ok_or_else(|| RuntimeCallError::NotFound(container_id.to_string()))?;
        container.terminate();
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn logs(&self, container_id: &str) -> LogChunkStream {
        let container = self.container(container_id);
        async_stream::stream! {
            let container = match container {
                Ok(container) => container,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let mut changes = container.changed.subscribe();
            let mut next = 0;
            loop {
                changes.borrow_and_update();
                let (chunks, done) = {
                    let state = container.state.lock().unwrap();
                    (state.output[next..].to_vec(), state.exit_code.is_some())
                };
                for chunk in chunks {
                    next += 1;
                    yield Ok(chunk);
                }
                if done || changes.changed().await.is_err() {
                    break;
                }
            }
        }
        .boxed()
    }
}

struct Harness {
    orchestrator: Orchestrator,
    runtime: Arc<SimRuntime>,
    workspace: TempDir,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let workspace = TempDir::new().unwrap();
    let mut config = SandcastleConfig::default();
    config.workspace.root = workspace.path().to_path_buf();
    config.docker.retry_backoff_ms = 10;
    let runtime = Arc::new(SimRuntime::default());
    let orchestrator = Orchestrator::new(config, runtime.clone()).unwrap();
    Harness {
        orchestrator,
        runtime,
        workspace,
    }
}

fn bash(script: &str) -> ExecutionRequest {
    ExecutionRequest::inline("bash", "job.sh", script)
}

fn container_id(harness: &Harness, execution_id: &str) -> String {
    harness
        .orchestrator
        .container_info(execution_id)
        .unwrap()
        .container_id
}

/// Drain the live log, then wait for the terminal status.
async fn run_to_end(harness: &Harness, execution_id: &str) -> (ExecutionStatus, Vec<LogEntry>) {
    let entries: Vec<LogEntry> = harness
        .orchestrator
        .log_stream(execution_id, None)
        .unwrap()
        .collect()
        .await;
    let status = harness.orchestrator.wait(execution_id).await.unwrap();
    (status, entries)
}

#[tokio::test(start_paused = true)]
async fn execute_returns_before_container_finishes() {
    let h = harness();
    let started = Instant::now();
    let id = h.orchestrator.execute(bash("sleep 10\necho done")).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.orchestrator.status(&id).unwrap().status, ExecutionStatus::Running);

    let (status, entries) = run_to_end(&h, &id).await;
    assert_eq!(status, ExecutionStatus::Succeeded);
    assert_eq!(entries.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exit_zero_succeeds_with_captured_output() {
    let h = harness();
    let id = h.orchestrator.execute(bash("echo hello")).await.unwrap();
    let (status, _) = run_to_end(&h, &id).await;
    assert_eq!(status, ExecutionStatus::Succeeded);

    let response = h.orchestrator.response(&id).unwrap();
    assert_eq!(response.exit_code, Some(0));
    assert_eq!(response.output.as_deref(), Some("hello\n"));
    assert_eq!(response.error, None);
    assert!(response.end_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn exit_one_fails() {
    let h = harness();
    let id = h
        .orchestrator
        .execute(bash("echoerr boom; exit 1"))
        .await
        .unwrap();
    let (status, _) = run_to_end(&h, &id).await;
    assert_eq!(status, ExecutionStatus::Failed);

    let response = h.orchestrator.response(&id).unwrap();
    assert_eq!(response.exit_code, Some(1));
    assert_eq!(response.error.as_deref(), Some("boom\n"));
}

#[tokio::test(start_paused = true)]
async fn deadline_times_out_and_removes_container() {
    let h = harness();
    let id = h
        .orchestrator
        .execute(bash("echo working; sleep 5; echo never").with_timeout(2))
        .await
        .unwrap();
    let container = container_id(&h, &id);
    let submitted = Instant::now();

    let (status, entries) = run_to_end(&h, &id).await;
    assert_eq!(status, ExecutionStatus::TimedOut);
    // Reached within one reaper interval of the deadline
    assert!(submitted.elapsed() <= Duration::from_millis(2500));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "working\n");

    let grace = Duration::from_secs(h.orchestrator.config().reaper.stop_grace_secs);
    tokio::time::sleep(grace).await;
    assert!(!h.runtime.exists(&container));
    assert!(h.orchestrator.record(&id).unwrap().container_removed);
    assert_eq!(h.orchestrator.status(&id).unwrap().status, ExecutionStatus::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn unsupported_runtime_creates_nothing() {
    let h = harness();
    let err = h
        .orchestrator
        .execute(ExecutionRequest::inline("cobol", "main.cob", "DISPLAY 'HI'."))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnsupportedRuntime { .. }));

    let err = h
        .orchestrator
        .execute(bash("echo hi").with_version("1"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnsupportedRuntime { .. }));
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_rejected_before_create() {
    let h = harness();
    let cases = vec![
        ExecutionRequest::project("bash", "../outside"),
        ExecutionRequest::project("bash", "missing-project"),
        ExecutionRequest::inline("bash", "job.py", "print('wrong runtime')"),
        ExecutionRequest::inline("bash", "../job.sh", "echo escape"),
    ];
    for request in cases {
        let err = h.orchestrator.execute(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSource(_)), "{:?}", err);
    }

    for request in [bash("echo hi").with_timeout(0), bash("echo hi").with_memory(0)] {
        let err = h.orchestrator.execute(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResourceRequest(_)), "{:?}", err);
    }
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_executions_of_one_project_are_independent() {
    let h = harness();
    let project = h.workspace.path().join("demo");
    std::fs::create_dir(&project).unwrap();
    std::fs::write(project.join("main.sh"), "echo from-file").unwrap();

    let (a, b) = tokio::join!(
        h.orchestrator.execute(
            ExecutionRequest::project("bash", "demo").with_command("echo one; sleep 1; exit 3")
        ),
        h.orchestrator.execute(
            ExecutionRequest::project("sh", "demo").with_command("echoerr two; sleep 2")
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);
    assert_ne!(container_id(&h, &a), container_id(&h, &b));

    let ((status_a, logs_a), (status_b, logs_b)) = tokio::join!(run_to_end(&h, &a), run_to_end(&h, &b));
    assert_eq!(status_a, ExecutionStatus::Failed);
    assert_eq!(status_b, ExecutionStatus::Succeeded);
    assert_eq!(
        logs_a.iter().map(|e| (e.stream, e.text.as_str())).collect::<Vec<_>>(),
        vec![(StreamType::Stdout, "one\n")]
    );
    assert_eq!(
        logs_b.iter().map(|e| (e.stream, e.text.as_str())).collect::<Vec<_>>(),
        vec![(StreamType::Stderr, "two\n")]
    );

    let infos = h.orchestrator.containers();
    assert!(infos.iter().all(|info| info.project_id.as_deref() == Some("demo")));
}

#[tokio::test(start_paused = true)]
async fn project_runs_default_file() {
    let h = harness();
    let project = h.workspace.path().join("demo");
    std::fs::create_dir(&project).unwrap();
    std::fs::write(project.join("main.sh"), "echo from-file").unwrap();

    let id = h
        .orchestrator
        .execute(ExecutionRequest::project("bash", "demo"))
        .await
        .unwrap();
    let spec = h.runtime.spec(&container_id(&h, &id));
    assert_eq!(spec.command, vec!["bash", "main.sh"]);
    assert_eq!(spec.working_dir, "/workspace");
    assert!(spec.volumes[0].ends_with(":/workspace"));

    let (status, entries) = run_to_end(&h, &id).await;
    assert_eq!(status, ExecutionStatus::Succeeded);
    assert_eq!(entries[0].text, "from-file\n");
}

#[tokio::test(start_paused = true)]
async fn limits_env_and_labels_reach_the_container() {
    let h = harness();
    let id = h
        .orchestrator
        .execute(
            bash("echo hi")
                .with_memory(64 * 1024 * 1024 * 1024)
                .with_timeout(10_000)
                .with_env("GREETING", "hello"),
        )
        .await
        .unwrap();
    let spec = h.runtime.spec(&container_id(&h, &id));
    let limits = &h.orchestrator.config().limits;

    assert_eq!(spec.limits.memory_bytes, limits.max_memory_bytes);
    assert_eq!(spec.limits.timeout_seconds, limits.max_timeout_secs);
    assert_eq!(spec.env, vec!["GREETING=hello"]);
    assert!(spec.network_disabled);
    assert_eq!(spec.name, format!("sandcastle-{}", id));
    assert_eq!(spec.labels.get("sandcastle.execution_id"), Some(&id));
}

#[tokio::test(start_paused = true)]
async fn cancel_wins_over_exit() {
    let h = harness();
    let long = h.orchestrator.execute(bash("sleep 30")).await.unwrap();
    h.orchestrator.cancel(&long).await.unwrap();
    assert_eq!(h.orchestrator.wait(&long).await.unwrap(), ExecutionStatus::Cancelled);

    // Container exits on its own before the reaper looks at it
    let quick = h.orchestrator.execute(bash("exit 0")).await.unwrap();
    tokio::task::yield_now().await;
    h.orchestrator.cancel(&quick).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    for id in [&long, &quick] {
        let record = h.orchestrator.record(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.container_removed);
    }
    assert_eq!(h.runtime.count(), 0);

    assert!(matches!(
        h.orchestrator.cancel(&long).await,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn log_replay_is_exactly_once_and_ordered() {
    let h = harness();
    let id = h
        .orchestrator
        .execute(bash("echo a; echoerr b; sleep 1; echo c; echo d"))
        .await
        .unwrap();

    // Consumer reads two entries, disconnects, then resumes
    let first: Vec<_> = h.orchestrator.log_stream(&id, None).unwrap().take(2).collect().await;
    let resume = first.last().unwrap().sequence + 1;
    let rest: Vec<_> = h.orchestrator.log_stream(&id, Some(resume)).unwrap().collect().await;

    let sequences: Vec<u64> = first.iter().chain(&rest).map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);

    let slice = h.orchestrator.logs(&id, Some(2)).unwrap();
    assert_eq!(
        slice.logs.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(),
        vec!["c\n", "d\n"]
    );
    assert_eq!(slice.next_sequence(), Some(4));
    assert_eq!(slice.text(StreamType::Stderr), "");
    assert_eq!(h.orchestrator.logs(&id, None).unwrap().text(StreamType::Stderr), "b\n");
}

#[tokio::test(start_paused = true)]
async fn transient_create_failures_are_retried() {
    let h = harness();
    h.runtime.transient_create_failures.store(2, Ordering::SeqCst);
    let id = h.orchestrator.execute(bash("echo ok")).await.unwrap();
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 3);
    assert_eq!(run_to_end(&h, &id).await.0, ExecutionStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn unreachable_runtime_surfaces_after_bounded_retries() {
    let h = harness();
    h.runtime.transient_create_failures.store(100, Ordering::SeqCst);
    let err = h.orchestrator.execute(bash("echo ok")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RuntimeUnavailable(_)));
    let attempts = h.orchestrator.config().docker.max_retries as usize + 1;
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), attempts);
}

#[tokio::test(start_paused = true)]
async fn start_failure_fails_and_cleans_up() {
    let h = harness();
    h.runtime.fail_start.store(true, Ordering::SeqCst);
    let err = h.orchestrator.execute(bash("echo ok")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ContainerStartError(_)));
    assert_eq!(h.runtime.count(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.runtime.count(), 0);
    assert!(h.orchestrator.containers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_failure_after_cancel_keeps_cancellation() {
    let h = harness();
    h.runtime.fail_start.store(true, Ordering::SeqCst);
    h.runtime.start_delay_ms.store(1700, Ordering::SeqCst);

    let (result, id) = tokio::join!(h.orchestrator.execute(bash("echo ok")), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let info = h.orchestrator.containers().pop().unwrap();
        assert_eq!(info.status, ExecutionStatus::Pending);
        let id = info.container_id.trim_start_matches("sandcastle-").to_string();
        h.orchestrator.cancel(&id).await.unwrap();
        id
    });
    assert!(matches!(result, Err(OrchestratorError::ContainerStartError(_))));

    let record = h.orchestrator.record(&id).unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(record.log_closed);

    // Released without ever being handed out
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.runtime.count(), 0);
    assert!(matches!(
        h.orchestrator.record(&id),
        Err(OrchestratorError::ExecutionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn delete_races_safely_with_reaper() {
    let h = harness();
    let id = h.orchestrator.execute(bash("sleep 30")).await.unwrap();
    let container = container_id(&h, &id);

    h.orchestrator.delete(&id).await.unwrap();
    assert!(!h.runtime.exists(&container));
    assert!(matches!(
        h.orchestrator.status(&id),
        Err(OrchestratorError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.delete(&id).await,
        Err(OrchestratorError::ExecutionNotFound(_))
    ));

    // Reaper cycles after the deletion find nothing left to do
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.runtime.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn log_stream_of_deleted_execution_closes() {
    let h = harness();
    let id = h.orchestrator.execute(bash("echo first; sleep 30")).await.unwrap();
    let mut stream = h.orchestrator.log_stream(&id, None).unwrap();
    assert_eq!(stream.next().await.unwrap().text, "first\n");

    h.orchestrator.delete(&id).await.unwrap();
    assert!(stream.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_and_removes_everything() {
    let h = harness();
    let a = h.orchestrator.execute(bash("sleep 30")).await.unwrap();
    let b = h.orchestrator.execute(bash("sleep 30")).await.unwrap();
    assert_eq!(h.orchestrator.containers().len(), 2);

    h.orchestrator.shutdown().await;

    assert_eq!(h.runtime.count(), 0);
    for id in [&a, &b] {
        assert_eq!(h.orchestrator.status(id).unwrap().status, ExecutionStatus::Cancelled);
    }
    assert!(h.orchestrator.containers().is_empty());
}

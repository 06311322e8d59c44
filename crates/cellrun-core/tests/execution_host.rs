//! Integration tests for the execution host with in-process units.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cellrun_core::host::{BUSY, NOT_READY, TERMINATED};
use cellrun_core::ipc::HostMessage;
use cellrun_core::unit::UnitEventSender;
use cellrun_core::{
    Error, ExecutionHost, ExecutionIo, ExecutionState, HostConfig, InterruptMode, Interpreter,
    RunError, ScriptInterpreter, ThreadSpawner, UnitHandle, UnitLifecycleState, UnitSpawner,
};

fn fast_config() -> HostConfig {
    HostConfig {
        init_timeout_ms: 2_000,
        execution_timeout_ms: 5_000,
        watchdog_ms: 1_000,
        fallback_grace_ms: 50,
        interrupt_mode: InterruptMode::Auto,
    }
}

fn script_host(config: HostConfig) -> ExecutionHost {
    ExecutionHost::new(Arc::new(ThreadSpawner::new(ScriptInterpreter::new)), config)
}

async fn ready_host() -> ExecutionHost {
    let host = script_host(fast_config());
    host.initialize().await.unwrap();
    host
}

/// Interpreter that panics on every run.
struct Panicky;

impl Interpreter for Panicky {
    fn run(&mut self, _: &str, _: &mut ExecutionIo<'_>) -> Result<(), RunError> {
        panic!("native extension crashed");
    }
}

/// Interpreter whose startup always fails.
struct BrokenKernel;

impl Interpreter for BrokenKernel {
    fn initialize(&mut self) -> Result<(), String> {
        Err("kernel module not found".to_string())
    }

    fn run(&mut self, _: &str, _: &mut ExecutionIo<'_>) -> Result<(), RunError> {
        Ok(())
    }
}

/// Spawner whose units accept envelopes and never answer.
struct SilentSpawner;

struct SilentUnit(#[allow(dead_code)] UnitEventSender);

impl UnitHandle for SilentUnit {
    fn post(&mut self, _: HostMessage) -> cellrun_core::Result<()> {
        Ok(())
    }

    fn terminate(&mut self) {}
}

impl UnitSpawner for SilentSpawner {
    fn spawn(&self, events: UnitEventSender) -> cellrun_core::Result<Box<dyn UnitHandle>> {
        Ok(Box::new(SilentUnit(events)))
    }

    fn supports_shared_memory(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "silent unit".to_string()
    }
}

/// Counts spawns of the wrapped spawner.
struct Counting {
    inner: ThreadSpawner,
    spawned: Arc<AtomicUsize>,
}

impl UnitSpawner for Counting {
    fn spawn(&self, events: UnitEventSender) -> cellrun_core::Result<Box<dyn UnitHandle>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn(events)
    }

    fn supports_shared_memory(&self) -> bool {
        self.inner.supports_shared_memory()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[tokio::test]
async fn test_normal_execution_collects_output_in_order() {
    let host = ready_host().await;
    assert_eq!(host.lifecycle(), UnitLifecycleState::Ready);

    let result = host.submit("print hello\neprint careful\nprint bye").await;

    assert_eq!(result.output, vec!["hello\n", "careful\n", "bye\n"]);
    assert!(result.error.is_none());
    assert!(result.is_complete);
    assert_eq!(result.state, ExecutionState::Complete);
    assert_eq!(host.execution_state(), ExecutionState::Complete);
    assert!(host.current_execution().is_none());
}

#[tokio::test]
async fn test_error_keeps_partial_output() {
    let host = ready_host().await;

    let result = host.submit("print partial\nraise NameError: x is not defined").await;

    assert_eq!(result.output, vec!["partial\n"]);
    assert_eq!(result.error.as_deref(), Some("NameError: x is not defined"));
    assert_eq!(result.state, ExecutionState::Failed);
    assert_eq!(host.execution_state(), ExecutionState::Failed);
}

#[tokio::test]
async fn test_state_persists_between_executions() {
    let host = ready_host().await;

    assert!(host.submit("set greeting hi").await.is_success());
    let result = host.submit("print $greeting there").await;

    assert_eq!(result.output, vec!["hi there\n"]);
}

#[tokio::test]
async fn test_submit_before_ready_is_rejected() {
    let host = script_host(fast_config());

    let pending = host.submit("print never");
    let rejection = pending.rejection().unwrap();
    assert!(rejection.output.is_empty());
    assert_eq!(rejection.error.as_deref(), Some(NOT_READY));

    let result = pending.await;
    assert!(!result.is_complete);
    assert_eq!(host.execution_state(), ExecutionState::Idle);
}

#[tokio::test]
async fn test_second_submit_while_running_is_rejected() {
    let host = ready_host().await;

    let first = host.submit("sleep 200\nprint first");
    let second = host.submit("print second");

    assert_eq!(
        second.rejection().and_then(|r| r.error.as_deref()),
        Some(BUSY)
    );
    let result = first.await;
    assert_eq!(result.output, vec!["first\n"]);

    // The unit is free again.
    assert!(host.submit("print third").await.is_success());
}

#[tokio::test]
async fn test_output_callback_sees_snapshots() {
    let host = ready_host().await;
    let snapshots = Arc::new(std::sync::Mutex::new(Vec::new()));

    let recorder = Arc::clone(&snapshots);
    let result = host
        .submit_with(
            "print a\nprint b\nraise boom",
            move |output: &[String], error: Option<&str>| {
                recorder
                    .lock()
                    .unwrap()
                    .push((output.len(), error.map(str::to_string)));
            },
        )
        .await;

    assert_eq!(result.error.as_deref(), Some("boom"));
    let snapshots = snapshots.lock().unwrap();
    assert_eq!(
        *snapshots,
        vec![(1, None), (2, None), (2, Some("boom".to_string()))]
    );
}

#[tokio::test]
async fn test_execution_timeout() {
    let host = script_host(HostConfig {
        execution_timeout_ms: 100,
        ..fast_config()
    });
    host.initialize().await.unwrap();

    let started = Instant::now();
    let result = host.submit("print slow\nsleep 2000").await;

    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(
        result.error.as_deref(),
        Some("Execution timed out after 100 ms")
    );
    assert_eq!(result.output, vec!["slow\n"]);
    assert_eq!(result.state, ExecutionState::Failed);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let host = ExecutionHost::new(
        Arc::new(Counting {
            inner: ThreadSpawner::new(ScriptInterpreter::new),
            spawned: Arc::clone(&spawned),
        }),
        fast_config(),
    );

    let (a, b) = tokio::join!(host.initialize(), host.initialize());
    a.unwrap();
    b.unwrap();
    host.initialize().await.unwrap();

    assert_eq!(spawned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_init_error_is_reported_and_sticky() {
    let host = ExecutionHost::new(Arc::new(ThreadSpawner::new(|| BrokenKernel)), fast_config());

    let err = host.initialize().await.unwrap_err();
    assert!(matches!(&err, Error::Initialization(msg) if msg.contains("kernel module not found")));
    assert_eq!(host.lifecycle(), UnitLifecycleState::Errored);

    // Errored units are not respawned implicitly.
    let again = host.initialize().await.unwrap_err();
    assert_eq!(again.to_string(), err.to_string());
    assert_eq!(
        host.submit("print x").rejection().and_then(|r| r.error.clone()),
        Some(NOT_READY.to_string())
    );
}

#[tokio::test]
async fn test_init_timeout() {
    let host = ExecutionHost::new(
        Arc::new(SilentSpawner),
        HostConfig {
            init_timeout_ms: 100,
            ..fast_config()
        },
    );

    let err = host.initialize().await.unwrap_err();
    assert!(
        matches!(&err, Error::Initialization(msg) if msg.contains("did not become ready")),
        "{}",
        err
    );
    assert!(host.last_error().is_some());
}

#[tokio::test]
async fn test_crash_fails_pending_and_marks_errored() {
    let host = ExecutionHost::new(Arc::new(ThreadSpawner::new(|| Panicky)), fast_config());
    host.initialize().await.unwrap();

    let result = host.submit("anything").await;

    let error = result.error.unwrap();
    assert!(error.starts_with("Execution unit crashed:"), "{}", error);
    assert!(error.contains("native extension crashed"), "{}", error);
    assert_eq!(result.state, ExecutionState::Failed);
    assert_eq!(host.lifecycle(), UnitLifecycleState::Errored);
    assert!(matches!(host.last_error(), Some(Error::UnitCrashed(_))));

    // A reset brings up a fresh unit.
    host.reset().await.unwrap();
    assert!(host.is_ready());
}

#[tokio::test]
async fn test_terminate_fails_pending_and_allows_reinit() {
    let host = ready_host().await;
    let generation = host.generation();

    let pending = host.submit("sleep 5000");
    host.terminate();

    let result = pending.await;
    assert_eq!(result.error.as_deref(), Some(TERMINATED));
    assert_eq!(host.lifecycle(), UnitLifecycleState::Uninitialized);
    assert_eq!(host.execution_state(), ExecutionState::Idle);

    host.initialize().await.unwrap();
    assert!(host.generation() > generation);
    assert!(host.submit("print back").await.is_success());
}

#[tokio::test]
async fn test_shutdown() {
    let host = ready_host().await;
    host.shutdown();

    assert_eq!(host.lifecycle(), UnitLifecycleState::Terminated);
    assert!(matches!(host.wait_ready().await, Err(Error::Shutdown)));
    assert_eq!(
        host.submit("print x").rejection().and_then(|r| r.error.clone()),
        Some(NOT_READY.to_string())
    );
}

#[tokio::test]
async fn test_dropping_host_resolves_pending() {
    let host = ready_host().await;
    let pending = host.submit("sleep 5000");
    drop(host);

    let result = pending.await;
    assert_eq!(
        result.error.as_deref(),
        Some(cellrun_core::host::HOST_DROPPED)
    );
}

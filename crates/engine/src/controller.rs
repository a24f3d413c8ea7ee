//! Execution controller.
//!
//! Orchestrates compile → bind → run → normalize for one request and folds
//! every outcome into an [`ExecutionResult`]. Each run gets its own worker
//! thread and its own VM; the caller's thread only waits on a channel, so a
//! snippet stuck in native code cannot hold the caller past the deadline.
//! A worker the controller gave up on is counted as detached until its
//! thread exits; while too many are detached, new runs are refused.
//!
//! State machine:
//!
//! ```text
//! Idle ──(empty code)──────────────────────────────▶ Done
//! Idle ──▶ Compiling ──▶ Running ──▶ Done
//!              │            │
//!              └──▶ Failed ◀┘
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scriptbox_config::Settings;

use crate::capabilities::CapabilitySet;
use crate::compiler::Snippet;
use crate::console::ConsoleSink;
use crate::error::EngineError;
use crate::request::{ExecutionRequest, ExecutionResult};
use crate::sandbox::{Abort, CancelToken, RunGuard, Sandbox, SandboxLimits};

/// Extra time the controller waits past the sandbox timeout before it stops
/// waiting for the worker. The VM hook normally ends the run well before.
pub const WORKER_GRACE: Duration = Duration::from_millis(500);

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Compiling,
    Running,
    Done,
    Failed,
}

/// Full outcome of one run, for Rust callers that need more than the wire shape.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: ExecutionResult,
    /// The failure behind a status-1 result.
    pub error: Option<EngineError>,
    /// Final state: `Done` or `Failed`.
    pub state: RunState,
    /// State the run was in when it ended (where it failed, for failures).
    pub last_phase: RunState,
    pub elapsed: Duration,
}

/// Shared view of a run's state, advanced by the worker and finished by the controller.
#[derive(Debug, Clone)]
struct Progress {
    run_id: u64,
    state: Arc<Mutex<RunState>>,
}

impl Progress {
    fn new(run_id: u64) -> Self {
        Self {
            run_id,
            state: Arc::new(Mutex::new(RunState::Idle)),
        }
    }

    fn advance(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!("run {}: {:?} -> {:?}", self.run_id, *state, next);
        *state = next;
    }

    fn current(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

const WORKER_RUNNING: u8 = 0;
const WORKER_DETACHED: u8 = 1;
const WORKER_FINISHED: u8 = 2;

/// Live worker threads of one engine (and its clones).
#[derive(Debug, Default)]
struct WorkerTracker {
    running: AtomicUsize,
    detached: AtomicUsize,
}

impl WorkerTracker {
    fn enlist(self: &Arc<Self>) -> WorkerTicket {
        self.running.fetch_add(1, Ordering::SeqCst);
        WorkerTicket {
            tracker: self.clone(),
            state: Arc::new(AtomicU8::new(WORKER_RUNNING)),
        }
    }
}

/// One worker's entry in the tracker. Finishing is idempotent.
#[derive(Debug, Clone)]
struct WorkerTicket {
    tracker: Arc<WorkerTracker>,
    state: Arc<AtomicU8>,
}

impl WorkerTicket {
    /// The controller stopped waiting for this worker.
    fn detach(&self) {
        self.tracker.detached.fetch_add(1, Ordering::SeqCst);
        let detached = self
            .state
            .compare_exchange(WORKER_RUNNING, WORKER_DETACHED, Ordering::SeqCst, Ordering::SeqCst);
        if detached.is_err() {
            // Exited before we got here
            self.tracker.detached.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn finish(&self) {
        let previous = self.state.swap(WORKER_FINISHED, Ordering::SeqCst);
        if previous == WORKER_FINISHED {
            return;
        }
        self.tracker.running.fetch_sub(1, Ordering::SeqCst);
        if previous == WORKER_DETACHED {
            self.tracker.detached.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Finishes the ticket when the worker closure is dropped, including on
/// panic and when the thread never spawned.
struct WorkerExit(WorkerTicket);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// The engine entry point. Clones share settings and worker accounting;
/// share it freely.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    settings: Settings,
    workers: Arc<WorkerTracker>,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            workers: Arc::default(),
        }
    }

    /// Worker threads that have not exited yet, detached ones included.
    pub fn running_workers(&self) -> usize {
        self.workers.running.load(Ordering::SeqCst)
    }

    /// Workers that outlived their deadline and are still running.
    pub fn detached_workers(&self) -> usize {
        self.workers.detached.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits::from(&self.settings.sandbox)
    }

    /// Run one request. Never panics, never returns an error: every failure is
    /// folded into the result (status 1, error as the last log entry).
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.execute_detailed(request, None).result
    }

    /// Run one request that can be cancelled by setting `cancel`.
    pub fn execute_with_cancel(&self, request: &ExecutionRequest, cancel: CancelToken) -> ExecutionResult {
        self.execute_detailed(request, Some(cancel)).result
    }

    pub fn execute_detailed(&self, request: &ExecutionRequest, cancel: Option<CancelToken>) -> Execution {
        let started = Instant::now();
        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
        let progress = Progress::new(run_id);

        if request.code.trim().is_empty() {
            progress.advance(RunState::Done);
            return Execution {
                result: ExecutionResult::empty(),
                error: None,
                state: RunState::Done,
                last_phase: RunState::Idle,
                elapsed: started.elapsed(),
            };
        }

        let detached = self.detached_workers();
        let max_detached = self.settings.sandbox.max_detached_workers;
        if detached >= max_detached {
            log::warn!("run {} refused: {} detached workers still running", run_id, detached);
            let err = EngineError::Setup(format!(
                "{} runaway workers are still running (limit {})",
                detached, max_detached
            ));
            progress.advance(RunState::Failed);
            return Execution {
                result: ExecutionResult::failure(Vec::new(), err.to_string(), 0),
                error: Some(err),
                state: RunState::Failed,
                last_phase: RunState::Idle,
                elapsed: started.elapsed(),
            };
        }

        let limits = self.limits();
        let capabilities = CapabilitySet::resolve(
            request.allowed_capabilities.as_deref(),
            &self.settings.capabilities.default,
        );
        let console = ConsoleSink::new(limits.max_log_entries);
        let guard = Arc::new(RunGuard::new(&limits, cancel));

        let outcome = self.run_on_worker(run_id, request, &limits, capabilities, &console, &guard, &progress);

        let last_phase = progress.current();
        let lines = console.lines();
        let dropped = console.dropped();
        let (result, error, state) = match outcome {
            Ok(value) => (ExecutionResult::success(value, lines, dropped), None, RunState::Done),
            Err(err) => {
                log::debug!("run {} failed: {}", run_id, err);
                (ExecutionResult::failure(lines, err.to_string(), dropped), Some(err), RunState::Failed)
            }
        };
        progress.advance(state);

        Execution {
            result,
            error,
            state,
            last_phase,
            elapsed: started.elapsed(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_on_worker(
        &self,
        run_id: u64,
        request: &ExecutionRequest,
        limits: &SandboxLimits,
        capabilities: CapabilitySet,
        console: &ConsoleSink,
        guard: &Arc<RunGuard>,
        progress: &Progress,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        let (tx, rx) = mpsc::channel();

        let job = WorkerJob {
            code: request.code.clone(),
            is_expression: request.is_expression,
            data: request.data_context.clone(),
            capabilities,
            http: self.settings.http.clone(),
            limits: limits.clone(),
            console: console.clone(),
            guard: guard.clone(),
            progress: progress.clone(),
        };

        let ticket = self.workers.enlist();
        let exit = WorkerExit(ticket.clone());

        let thread_name = format!("sandbox-run-{}", run_id);
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _exit = exit;
                let outcome = job.run();
                // The controller may have stopped waiting
                let _ = tx.send(outcome);
            })
            .map_err(|e| EngineError::Setup(format!("failed to spawn worker: {}", e)))?;

        match rx.recv_timeout(limits.timeout + WORKER_GRACE) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                // Stuck in native code; the hook stops it once it re-enters the VM
                guard.trip(Abort::Timeout);
                ticket.detach();
                log::warn!("{} did not stop within its deadline; detaching", thread_name);
                Err(guard.error_for(guard.tripped().unwrap_or(Abort::Timeout)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!("{} panicked", thread_name);
                Err(EngineError::Runtime("sandbox worker panicked".to_string()))
            }
        }
    }
}

/// Everything a worker needs, moved onto its thread.
struct WorkerJob {
    code: String,
    is_expression: bool,
    data: serde_json::Value,
    capabilities: CapabilitySet,
    http: scriptbox_config::HttpSettings,
    limits: SandboxLimits,
    console: ConsoleSink,
    guard: Arc<RunGuard>,
    progress: Progress,
}

impl WorkerJob {
    fn run(self) -> Result<Option<serde_json::Value>, EngineError> {
        self.progress.advance(RunState::Compiling);
        let sandbox = Sandbox::with_guard(&self.limits, &self.console, self.guard.clone())?;
        let unit = sandbox.compile(&Snippet::new(&self.code, self.is_expression))?;

        self.progress.advance(RunState::Running);
        sandbox.bind(&self.data, &self.capabilities, &self.http)?;
        sandbox.run(&unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::STATUS_FAILED;
    use serde_json::json;

    #[test]
    fn test_empty_code_never_reaches_a_worker() {
        let execution = Engine::default().execute_detailed(&ExecutionRequest::statements("  \n\t"), None);
        assert_eq!(execution.state, RunState::Done);
        assert_eq!(execution.last_phase, RunState::Idle);
        assert_eq!(execution.result, ExecutionResult::empty());
    }

    #[test]
    fn test_compile_failure_phase() {
        let execution = Engine::default().execute_detailed(&ExecutionRequest::statements("local = 1"), None);
        assert_eq!(execution.state, RunState::Failed);
        assert_eq!(execution.last_phase, RunState::Compiling);
        assert_eq!(execution.result.status, STATUS_FAILED);
        assert!(matches!(execution.error, Some(EngineError::Compile(_))));
    }

    #[test]
    fn test_runtime_failure_phase() {
        let request = ExecutionRequest::statements("console.log('before') error('late')");
        let execution = Engine::default().execute_detailed(&request, None);
        assert_eq!(execution.state, RunState::Failed);
        assert_eq!(execution.last_phase, RunState::Running);
        assert_eq!(execution.result.log[0], "before");
        assert_eq!(execution.result.log[1], "RuntimeError: snippet:1: late");
    }

    #[test]
    fn test_success() {
        let request = ExecutionRequest::expression("data.a * 2").with_data(json!({ "a": 21 }));
        let execution = Engine::default().execute_detailed(&request, None);
        assert_eq!(execution.state, RunState::Done);
        assert!(execution.error.is_none());
        assert_eq!(execution.result.value, Some(json!(42)));
    }

    #[test]
    fn test_worker_ticket_accounting() {
        let tracker = Arc::new(WorkerTracker::default());
        let ticket = tracker.enlist();
        ticket.detach();
        assert_eq!(tracker.running.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.detached.load(Ordering::SeqCst), 1);

        ticket.finish();
        ticket.finish();
        assert_eq!(tracker.running.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.detached.load(Ordering::SeqCst), 0);

        // Exiting before the controller gives up never counts as detached
        let early = tracker.enlist();
        early.finish();
        early.detach();
        assert_eq!(tracker.running.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.detached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_runaway_workers_block_new_runs() {
        let mut settings = Settings::default();
        settings.sandbox.max_detached_workers = 1;
        let engine = Engine::new(settings);

        let stuck = engine.workers.enlist();
        stuck.detach();
        let execution = engine.execute_detailed(&ExecutionRequest::expression("1"), None);
        assert_eq!(execution.state, RunState::Failed);
        assert_eq!(execution.last_phase, RunState::Idle);
        assert_eq!(
            execution.result.log,
            vec!["RuntimeError: sandbox setup failed: 1 runaway workers are still running (limit 1)"]
        );

        stuck.finish();
        let execution = engine.execute_detailed(&ExecutionRequest::expression("1"), None);
        assert_eq!(execution.result.value, Some(json!(1)));
    }

    #[test]
    fn test_workers_are_released() {
        let engine = Engine::default();
        let clone = engine.clone();
        assert_eq!(engine.execute(&ExecutionRequest::expression("2")).value, Some(json!(2)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while clone.running_workers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(clone.running_workers(), 0);
        assert_eq!(clone.detached_workers(), 0);
    }

    #[test]
    fn test_engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }
}

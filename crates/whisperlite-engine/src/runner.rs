use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use whisperlite_observability::{metrics, trace, trace::Span};

use crate::{
    job::{CancelFlag, JobId, JobState, Message},
    operation::Operation,
};

pub const PROGRESS_LOADING: &str = "loading";
pub const PROGRESS_RUNNING: &str = "running";

#[derive(Debug, Error)]
pub enum StartError {
    /// The single slot is taken. Nothing about the running job changed.
    #[error("another job is already running: {active}")]
    Rejected { active: JobId },
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag is set. The worker honors it only after setup and after the
    /// unit of work, so the job may still run for a long time, and a unit of
    /// work that never returns is never stopped.
    Requested,
    /// The job had already ended; nothing changed.
    AlreadyFinished,
}

impl CancelOutcome {
    pub fn advisory_note(self) -> &'static str {
        match self {
            CancelOutcome::Requested => {
                "cancellation requested; work already in progress cannot be interrupted and may finish before the request is honored"
            }
            CancelOutcome::AlreadyFinished => "job already finished",
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveJob {
    job_id: JobId,
    cancel: CancelFlag,
    started_at: Instant,
}

type Slot = Arc<Mutex<Option<ActiveJob>>>;

/// Runs at most one job at a time.
///
/// There is no timeout: a unit of work that never returns keeps the slot
/// occupied for good. [`JobRunner::running_for`] exposes how long the current
/// job has been going so callers can surface that.
#[derive(Clone, Default)]
pub struct JobRunner {
    inner: Slot,
    data_dir: Option<PathBuf>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs write trace spans and metrics lines under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Slot::default(),
            data_dir: Some(data_dir.into()),
        }
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.inner).is_some()
    }

    pub fn active_job(&self) -> Option<JobId> {
        lock(&self.inner).as_ref().map(|a| a.job_id.clone())
    }

    pub fn running_for(&self) -> Option<Duration> {
        lock(&self.inner).as_ref().map(|a| a.started_at.elapsed())
    }

    /// Launches `op` on a new worker thread and returns without waiting for it.
    pub fn start<I, O>(&self, op: O, input: I) -> Result<JobHandle<O::Output>, StartError>
    where
        I: Send + 'static,
        O: Operation<I>,
    {
        let job_id = JobId::new();
        let cancel = CancelFlag::new();
        {
            let mut g = lock(&self.inner);
            if let Some(active) = g.as_ref() {
                if let Some(dir) = &self.data_dir {
                    trace::event(
                        dir,
                        Some(active.job_id.as_str()),
                        "Job",
                        "JOB.start",
                        "rejected",
                        None,
                    );
                }
                return Err(StartError::Rejected {
                    active: active.job_id.clone(),
                });
            }
            *g = Some(ActiveJob {
                job_id: job_id.clone(),
                cancel: cancel.clone(),
                started_at: Instant::now(),
            });
        }

        let state = Arc::new(Mutex::new(JobState::Running));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            job_id: job_id.clone(),
            cancel: cancel.clone(),
            state: state.clone(),
            slot: self.inner.clone(),
            tx,
            data_dir: self.data_dir.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("job-worker-{}", &job_id.as_str()[..8]))
            .spawn(move || worker.run(op, input));
        if let Some(dir) = &self.data_dir {
            let status = if spawned.is_ok() { "ok" } else { "err" };
            trace::event(dir, Some(job_id.as_str()), "Job", "JOB.start", status, None);
        }
        if let Err(e) = spawned {
            // The closure, and the worker in it, were dropped: the slot is
            // already free again and the state is Failed.
            return Err(StartError::Spawn(e));
        }

        Ok(JobHandle {
            job_id,
            cancel,
            state,
            rx,
            exhausted: false,
        })
    }

    /// Asks the job to stop at its next checkpoint. See [`CancelOutcome`].
    ///
    /// Only the job occupying this runner's slot can be cancelled; a handle
    /// that is finished or belongs to another runner is left alone.
    pub fn request_cancel<T>(&self, handle: &JobHandle<T>) -> CancelOutcome {
        if handle.state().is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        self.cancel_active(&handle.job_id)
    }

    /// Cancels by id for callers that no longer hold the handle, e.g. a
    /// separate "stop" command. A stale id is treated as already finished.
    pub fn cancel_active(&self, job_id: &JobId) -> CancelOutcome {
        let running_for = {
            let g = lock(&self.inner);
            match g.as_ref() {
                Some(active) if &active.job_id == job_id => {
                    active.cancel.request();
                    active.started_at.elapsed()
                }
                _ => return CancelOutcome::AlreadyFinished,
            }
        };
        if let Some(dir) = &self.data_dir {
            trace::event(
                dir,
                Some(job_id.as_str()),
                "Job",
                "JOB.cancel_requested",
                "ok",
                Some(json!({ "running_ms": running_for.as_millis() })),
            );
        }
        CancelOutcome::Requested
    }

    /// Drains whatever the worker has queued so far without blocking.
    pub fn poll<T>(&self, handle: &mut JobHandle<T>) -> Vec<Message<T>> {
        handle.drain()
    }
}

/// The caller's side of one job.
pub struct JobHandle<T> {
    job_id: JobId,
    cancel: CancelFlag,
    state: Arc<Mutex<JobState>>,
    rx: mpsc::UnboundedReceiver<Message<T>>,
    exhausted: bool,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> JobState {
        *lock(&self.state)
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// True once the terminal message has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn drain(&mut self) -> Vec<Message<T>> {
        let mut out = Vec::new();
        while !self.exhausted {
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.exhausted = msg.is_terminal();
                    out.push(msg);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // The worker always sends a terminal message before it
                    // drops the sender; keep the caller's contract if it did not.
                    self.exhausted = true;
                    let mut state = lock(&self.state);
                    if !state.is_terminal() {
                        *state = JobState::Failed;
                    }
                    out.push(Message::Error(
                        "worker exited without a terminal message".to_string(),
                    ));
                }
            }
        }
        out
    }
}

struct Worker<T> {
    job_id: JobId,
    cancel: CancelFlag,
    state: Arc<Mutex<JobState>>,
    slot: Slot,
    tx: mpsc::UnboundedSender<Message<T>>,
    data_dir: Option<PathBuf>,
}

impl<T> Worker<T> {
    fn run<I, O>(self, mut op: O, input: I)
    where
        O: Operation<I, Output = T>,
    {
        let t0 = Instant::now();
        self.send(Message::Progress(PROGRESS_LOADING.to_string()));
        let terminal = self.drive(&mut op, &input, t0);

        let span = self.span("JOB.release");
        match panic::catch_unwind(AssertUnwindSafe(|| op.release())) {
            Ok(()) => end_ok(span),
            Err(p) => {
                let msg = panic_message(p.as_ref());
                whisperlite_observability::safe_eprintln!(
                    "job {}: release panicked: {msg}",
                    self.job_id
                );
                if let Some(s) = span {
                    s.err("panic", "E_JOB_RELEASE", &msg, None);
                }
            }
        }

        self.finish(terminal, t0.elapsed());
    }

    fn drive<I, O>(&self, op: &mut O, input: &I, t0: Instant) -> Message<T>
    where
        O: Operation<I, Output = T>,
    {
        let span = self.span("JOB.setup");
        let mut report = |text: String| self.send(Message::Progress(text));
        if let Err(e) = guarded(|| op.setup(input, &mut report)) {
            if let Some(s) = span {
                s.err_anyhow("engine", "E_JOB_SETUP", &e, None);
            }
            return Message::Error(format!("{e:#}"));
        }
        end_ok(span);

        if self.cancel.is_requested() {
            if let Some(s) = self.span("JOB.run") {
                s.skipped("cancelled before work", None);
            }
            return Message::CancelledBeforeWork;
        }

        self.send(Message::Progress(PROGRESS_RUNNING.to_string()));
        let span = self.span("JOB.run");
        match guarded(|| op.run(input, &self.cancel)) {
            Ok(payload) => {
                end_ok(span);
                if self.cancel.is_requested() {
                    return Message::CancelledAfterWork;
                }
                Message::Result {
                    payload,
                    elapsed: t0.elapsed(),
                }
            }
            Err(e) => {
                if let Some(s) = span {
                    s.err_anyhow("engine", "E_JOB_RUN", &e, None);
                }
                Message::Error(format!("{e:#}"))
            }
        }
    }

    /// Records the terminal state and frees the slot before the terminal
    /// message goes out, so a caller that has seen it can start again.
    fn finish(self, terminal: Message<T>, elapsed: Duration) {
        let state = terminal.terminal_state().unwrap_or(JobState::Failed);
        *lock(&self.state) = state;
        self.free_slot();

        if let Some(dir) = &self.data_dir {
            trace::event(
                dir,
                Some(self.job_id.as_str()),
                "Job",
                "JOB.finished",
                state.as_str(),
                Some(json!({ "elapsed_ms": elapsed.as_millis() })),
            );
            record_metrics(
                dir,
                &json!({
                    "type": "job_done",
                    "job_id": self.job_id,
                    "state": state.as_str(),
                    "elapsed_ms": elapsed.as_millis(),
                }),
            );
        }
        self.send(terminal);
    }

    fn free_slot(&self) {
        let mut g = lock(&self.slot);
        if g.as_ref().map(|a| &a.job_id) == Some(&self.job_id) {
            *g = None;
        }
    }

    fn send(&self, msg: Message<T>) {
        if let Some(dir) = &self.data_dir {
            let text = match &msg {
                Message::Progress(t) | Message::Error(t) => Some(t.as_str()),
                _ => None,
            };
            let elapsed_ms = match &msg {
                Message::Result { elapsed, .. } => Some(elapsed.as_millis()),
                _ => None,
            };
            record_metrics(
                dir,
                &json!({
                    "type": "job_event",
                    "job_id": self.job_id,
                    "kind": msg.kind(),
                    "message": text,
                    "elapsed_ms": elapsed_ms,
                }),
            );
        }
        // A dropped handle means nobody is listening anymore.
        let _ = self.tx.send(msg);
    }

    fn span(&self, step_id: &str) -> Option<Span> {
        self.data_dir
            .as_deref()
            .map(|dir| Span::start(dir, Some(self.job_id.as_str()), "Job", step_id, None))
    }
}

impl<T> Drop for Worker<T> {
    // Covers a worker that never ran (spawn failure) or died in bookkeeping.
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if !state.is_terminal() {
            *state = JobState::Failed;
        }
        drop(state);
        self.free_slot();
    }
}

fn end_ok(span: Option<Span>) {
    if let Some(s) = span {
        s.ok(None);
    }
}

fn record_metrics(dir: &Path, line: &serde_json::Value) {
    if let Err(e) = metrics::append_jsonl(dir, line) {
        whisperlite_observability::safe_eprintln!("metrics append failed (job): {e:#}");
    }
}

fn guarded<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(p) => Err(anyhow!("operation panicked: {}", panic_message(p.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

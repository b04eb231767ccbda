use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
    CancelledBeforeStart,
    CancelledDuringRun,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Idle | JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::CancelledBeforeStart => "cancelled_before_start",
            JobState::CancelledDuringRun => "cancelled_during_run",
        }
    }
}

/// What the worker tells the caller. A job produces zero or more `Progress`
/// messages followed by exactly one terminal message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    Progress(String),
    Result { payload: T, elapsed: Duration },
    Error(String),
    /// Cancellation was seen after setup; the unit of work never started.
    CancelledBeforeWork,
    /// Cancellation was seen after the unit of work finished; its output was
    /// discarded.
    CancelledAfterWork,
}

impl<T> Message<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Message::Progress(_))
    }

    /// The job state a terminal message leaves behind.
    pub fn terminal_state(&self) -> Option<JobState> {
        match self {
            Message::Progress(_) => None,
            Message::Result { .. } => Some(JobState::Completed),
            Message::Error(_) => Some(JobState::Failed),
            Message::CancelledBeforeWork => Some(JobState::CancelledBeforeStart),
            Message::CancelledAfterWork => Some(JobState::CancelledDuringRun),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Progress(_) => "progress",
            Message::Result { .. } => "result",
            Message::Error(_) => "error",
            Message::CancelledBeforeWork => "cancelled_before_work",
            Message::CancelledAfterWork => "cancelled_after_work",
        }
    }
}

/// Shared cancellation request. The caller sets it; the worker only reads it
/// at its checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

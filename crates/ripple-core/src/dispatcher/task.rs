//! Task identity, state machine and outcome types (spec's "AsyncLet").

use crate::error::RippleError;

/// Opaque task identity. Stable for the lifetime of the task's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

/// Lifecycle states from the data model: a task is `Running` until a step
/// resolves it one of three ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
    Cancelled,
    Failed,
}

/// Why a task did not finish successfully.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Failed(String),
    /// The task's future panicked during a `poll`; the dispatcher catches
    /// this at the poll boundary so one runaway task cannot take the whole
    /// reactor down with it.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub(crate) fn from_ripple(err: RippleError) -> Self {
        match err {
            RippleError::Cancelled => TaskError::Cancelled,
            other => TaskError::Failed(other.to_string()),
        }
    }
}

/// Snapshot handed to done-callbacks when a task reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub error: Option<TaskError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.state, TaskState::Finished)
    }
}

pub(crate) type DoneCallback = Box<dyn FnOnce(&TaskOutcome)>;

pub(crate) struct TaskSlot {
    pub(crate) future: Option<crate::dispatcher::BoxTaskFuture>,
    pub(crate) state: TaskState,
    pub(crate) cancel_requested: bool,
    pub(crate) outcome: Option<TaskOutcome>,
    pub(crate) done_callbacks: Vec<DoneCallback>,
}

impl TaskSlot {
    pub(crate) fn new() -> Self {
        Self {
            future: None,
            state: TaskState::Running,
            cancel_requested: false,
            outcome: None,
            done_callbacks: Vec::new(),
        }
    }
}

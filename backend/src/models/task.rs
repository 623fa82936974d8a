//! Task model
//!
//! A task is one line of model logic that can suspend itself by waiting for
//! a future tick, be resumed, be interrupted, and finally terminate.
//!
//! The scheduler owns every task's record ([`TaskSlot`]); collaborators only
//! ever hold a [`TaskHandle`].
//!
//! # State machine
//!
//! ```text
//!            wait_for                 interrupt
//!  RUNNABLE ─────────▶ WAITING ──────────────────▶ INTERRUPTED
//!     ▲  ▲               │                            │
//!     │  └── event fires ┘                            │
//!     └────────────── resumed immediately ────────────┘
//!
//!  RUNNABLE ── returns / faults / self-kill ──▶ TERMINATED
//!  WAITING, INTERRUPTED ── kill ──▶ TERMINATED
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::entity::EntityRef;
use crate::models::event::{EventHandle, Priority};
use crate::orchestrator::engine::SchedulerError;
use crate::trace::TraceContext;

/// Handle to a task owned by a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Wrap a raw id
    #[inline]
    pub fn new(raw: u64) -> Self {
        TaskHandle(raw)
    }

    /// Return the raw id
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T#{}", self.0)
    }
}

/// Execution state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Holds the hand-off token and is executing model logic
    Runnable,
    /// Suspended until its pending event fires
    Waiting,
    /// Its wait was cancelled; it will be resumed ahead of all events
    Interrupted,
    /// Finished; no further transitions
    Terminated,
}

impl TaskState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Runnable, Waiting)
                | (Runnable, Terminated)
                | (Waiting, Runnable)
                | (Waiting, Interrupted)
                | (Waiting, Terminated)
                | (Interrupted, Runnable)
                | (Interrupted, Terminated)
        )
    }

    /// Whether the task has finished
    pub fn is_terminal(self) -> bool {
        self == TaskState::Terminated
    }

    /// Upper-case label used in logs
    pub fn label(self) -> &'static str {
        match self {
            TaskState::Runnable => "RUNNABLE",
            TaskState::Waiting => "WAITING",
            TaskState::Interrupted => "INTERRUPTED",
            TaskState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a task was last resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Wakeup {
    /// First run, from the start event
    Started,
    /// Its pending event fired in virtual-time order
    Fired,
    /// Its wait was cancelled by `interrupt`
    Interrupted,
}

/// How a terminated task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// The body returned `Ok`
    Completed,
    /// Removed by `kill` or scheduler teardown
    Killed,
    /// The body failed; carries the fault detail
    Faulted(String),
}

/// Failure raised by a task body
///
/// Task bodies return `Result<(), TaskFault>`; scheduler errors convert with
/// `?`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskFault {
    #[error("scheduler rejected request: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("{0}")]
    Model(String),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task suspended outside wait_for")]
    SuspendedOutsideWait,
}

impl TaskFault {
    /// Fault raised by model logic
    pub fn model(message: impl Into<String>) -> Self {
        TaskFault::Model(message.into())
    }
}

/// Result type returned by task bodies
pub type TaskResult = Result<(), TaskFault>;

/// Boxed task body as stored by the scheduler
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>>;

/// Number of most recent states kept per task by `task_history`
pub const HISTORY_LIMIT: usize = 64;

fn push_capped(history: &mut VecDeque<TaskState>, state: TaskState) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(state);
}

/// Scheduler-side record of one task
pub(crate) struct TaskSlot {
    pub(crate) entity: EntityRef,
    pub(crate) state: TaskState,
    /// `None` while the driving loop is polling it, and after termination
    pub(crate) future: Option<TaskFuture>,
    /// Live event while WAITING
    pub(crate) pending: Option<EventHandle>,
    pub(crate) trace: TraceContext,
    pub(crate) wakeup: Option<Wakeup>,
    /// Set once the start event has fired
    pub(crate) started: bool,
    /// Priority of the most recent wait, used for fault records
    pub(crate) last_priority: Priority,
    pub(crate) outcome: Option<TaskOutcome>,
    pub(crate) history: VecDeque<TaskState>,
}

/// What is kept of a task once it has terminated
pub(crate) struct FinishedTask {
    pub(crate) outcome: TaskOutcome,
    pub(crate) history: VecDeque<TaskState>,
}

impl TaskSlot {
    /// A new task parked on its start event
    pub(crate) fn new(entity: EntityRef, future: TaskFuture, trace: TraceContext, priority: Priority) -> Self {
        Self {
            entity,
            state: TaskState::Waiting,
            future: Some(future),
            pending: None,
            trace,
            wakeup: None,
            started: false,
            last_priority: priority,
            outcome: None,
            history: VecDeque::from([TaskState::Waiting]),
        }
    }

    /// Move to `next`, enforcing the state machine
    pub(crate) fn transition(&mut self, handle: TaskHandle, next: TaskState) -> Result<(), SchedulerError> {
        if self.state.is_terminal() {
            return Err(SchedulerError::DeadTask(handle));
        }
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                task: handle,
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(task = %handle, from = %self.state, to = %next, "task transition");
        self.state = next;
        push_capped(&mut self.history, next);
        Ok(())
    }

    /// Terminate with `outcome`, handing back the future so the caller can
    /// drop it outside the scheduler lock
    pub(crate) fn terminate(
        &mut self,
        handle: TaskHandle,
        outcome: TaskOutcome,
    ) -> Result<Option<TaskFuture>, SchedulerError> {
        self.transition(handle, TaskState::Terminated)?;
        self.pending = None;
        self.outcome = Some(outcome);
        Ok(self.future.take())
    }

    /// Drop everything but the outcome and history of a terminated task
    pub(crate) fn into_finished(self) -> Option<FinishedTask> {
        Some(FinishedTask {
            outcome: self.outcome?,
            history: self.history,
        })
    }
}

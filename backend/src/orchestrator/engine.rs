//! Scheduler engine - main event loop
//!
//! Drives cooperative tasks through virtual time:
//! - Tasks are futures; `wait_for` is their only suspension point
//! - The future-event list decides which task runs next
//! - A single hand-off token guarantees that one task runs at a time
//!
//! # Architecture
//!
//! ```text
//! loop:
//! 1. Stop requested or wall-clock bound hit?  → return
//! 2. Interrupted task waiting to observe it?  → resume it now (no clock change)
//! 3. Peek earliest event                      → none: return Exhausted
//!                                               past tick bound: return TickLimit
//! 4. Pace against wall clock (if enabled)
//! 5. Pop event, advance clock, hand token to its task (one lock hold)
//! 6. Poll the task once (lock released, panics contained)
//! 7. Settle: WAITING again, completed, killed, or faulted
//! ```
//!
//! The scheduler lock is never held while a task is polled or dropped, so
//! task bodies may call back into the scheduler freely. A task is claimed
//! (made RUNNABLE and given the token) under the same lock hold that picks
//! it, so `interrupt` and `kill` from other threads see either a WAITING
//! task with a live event or a RUNNABLE one, never a task in between.
//!
//! Terminated tasks keep only their outcome and recent state history; the
//! event log is the one structure that grows with the run, and
//! [`Scheduler::take_event_log`] drains it.
//!
//! # Example
//!
//! ```rust
//! use sim_kernel_core::{NamedEntity, Scheduler, SchedulerConfig, TaskOutcome};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
//! let task = scheduler
//!     .start(NamedEntity::shared("Clerk"), "serve", 0, 0, |ctx| async move {
//!         ctx.wait_for(250, 0).await?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! scheduler.run().unwrap();
//! assert_eq!(scheduler.now(), 250);
//! assert_eq!(scheduler.task_outcome(task), Some(TaskOutcome::Completed));
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::task::noop_waker_ref;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::clock::{Clock, ClockError, Tick};
use crate::core::pacing::RealTimePacer;
use crate::models::entity::EntityRef;
use crate::models::event::{Event, EventHandle, EventLog, EventRecord, EventStatus, Priority};
use crate::models::task::{
    FinishedTask, TaskFault, TaskFuture, TaskHandle, TaskOutcome, TaskResult, TaskSlot, TaskState,
    Wakeup,
};
use crate::orchestrator::config::SchedulerConfig;
use crate::orchestrator::context::{TaskContext, WaitTarget};
use crate::queue::{EventQueue, QueueError};
use crate::trace::{TraceContext, TraceHook};

/// Longest single sleep while pacing, so stop requests stay responsive
const PACING_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Errors and results
// ============================================================================

/// Scheduler error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("task {0} is terminated")]
    DeadTask(TaskHandle),

    #[error("task {0} already terminated")]
    AlreadyTerminated(TaskHandle),

    #[error("task {0} is not waiting")]
    NotWaiting(TaskHandle),

    #[error("task {0} does not hold the run token")]
    NotRunnable(TaskHandle),

    #[error("task {0} is not known to this scheduler")]
    UnknownTask(TaskHandle),

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskHandle,
        from: TaskState,
        to: TaskState,
    },

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduling {delay} ticks after tick {now} overflows")]
    TickOverflow { now: Tick, delay: Tick },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Why a run returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// No events left and no task waiting to observe an interrupt
    Exhausted,
    /// `stop()` was called
    Stopped,
    /// The next event lies beyond the requested tick bound
    TickLimit,
    /// The requested wall-clock duration elapsed
    WallClockLimit,
}

/// Result of one call to `run`, `run_until` or `run_for`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub reason: StopReason,
    /// Clock tick when the run returned
    pub final_tick: Tick,
    /// Events fired during this run
    pub events_fired: u64,
    /// Task segments resumed during this run (events plus interrupts)
    pub resumptions: u64,
    /// Tasks that faulted during this run
    pub tasks_faulted: u64,
}

#[derive(Debug, Default)]
struct RunLimits {
    until_tick: Option<Tick>,
    deadline: Option<Instant>,
}

impl RunLimits {
    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// What the driving loop should do next
enum Step {
    /// Poll a task that already holds the token; the flag is set when an
    /// event fired to resume it
    Resume(TaskHandle, TaskFuture, bool),
    Pace(Duration),
    Done(StopReason),
}

// ============================================================================
// Shared state
// ============================================================================

struct Inner {
    clock: Clock,
    pacer: Option<RealTimePacer>,
    queue: EventQueue,
    /// Live tasks
    tasks: BTreeMap<TaskHandle, TaskSlot>,
    finished: BTreeMap<TaskHandle, FinishedTask>,
    /// Interrupted tasks, resumed ahead of every event in FIFO order
    ready: VecDeque<TaskHandle>,
    /// Hand-off token: the one task allowed to execute
    token: Option<TaskHandle>,
    /// Event whose firing started the current segment
    firing: Option<Event>,
    log: EventLog,
    record_events: bool,
    running: bool,
}

impl Inner {
    fn record(&mut self, event: &Event, status: EventStatus) {
        if self.record_events {
            let record = EventRecord::from_event(event, &self.clock, status);
            self.log.log(record);
        }
    }

    /// Record for a segment that was not started by an event
    fn synthesized_record(&self, task: TaskHandle, status: EventStatus) -> Option<EventRecord> {
        let slot = self.tasks.get(&task)?;
        let now = self.clock.now();
        Some(EventRecord {
            sched_tick: now,
            sched_time: self.clock.to_sim_time(now),
            priority: slot.last_priority,
            caller_name: slot.entity.name().to_string(),
            caller_input_name: slot.entity.input_name().to_string(),
            class_method: slot.trace.class_method(slot.entity.as_ref()),
            file_line: slot.trace.file_line(),
            added_time: self.clock.to_sim_time(now),
            status,
            fault: None,
        })
    }

    fn tick_after(&self, delay: Tick) -> Result<Tick, SchedulerError> {
        let now = self.clock.now();
        now.checked_add(delay)
            .ok_or(SchedulerError::TickOverflow { now, delay })
    }

    fn reanchor_pacer(&mut self) {
        let sim_time = self.clock.to_sim_time(self.clock.now());
        self.pacer = self
            .clock
            .real_time_factor()
            .and_then(|factor| RealTimePacer::new(factor, sim_time));
    }

    fn state_of(&self, task: TaskHandle) -> Result<TaskState, SchedulerError> {
        match self.tasks.get(&task) {
            Some(slot) => Ok(slot.state),
            None if self.finished.contains_key(&task) => Ok(TaskState::Terminated),
            None => Err(SchedulerError::UnknownTask(task)),
        }
    }

    /// Terminate a live task and keep only its outcome and history
    ///
    /// Hands back the future, if the slot still held it, so the caller can
    /// drop it outside the lock.
    fn finish(&mut self, task: TaskHandle, outcome: TaskOutcome) -> Result<Option<TaskFuture>, SchedulerError> {
        let Some(slot) = self.tasks.get_mut(&task) else {
            return Err(SchedulerError::DeadTask(task));
        };
        let future = slot.terminate(task, outcome)?;
        if let Some(done) = self.tasks.remove(&task).and_then(TaskSlot::into_finished) {
            self.finished.insert(task, done);
        }
        Ok(future)
    }

    /// Kill every live task and drop all pending work
    ///
    /// Returns how many tasks were killed and the futures to drop outside
    /// the lock.
    fn kill_all(&mut self) -> (usize, Vec<TaskFuture>) {
        let live: Vec<TaskHandle> = self.tasks.keys().copied().collect();

        let mut futures = Vec::new();
        for task in &live {
            if let Err(e) = self.cancel_pending(*task, EventStatus::Terminated) {
                debug!(task = %task, error = %e, "ignoring cancel failure during shutdown");
            }
            match self.finish(*task, TaskOutcome::Killed) {
                Ok(Some(future)) => futures.push(future),
                Ok(None) => {}
                Err(e) => debug!(task = %task, error = %e, "ignoring kill failure during shutdown"),
            }
        }
        self.ready.clear();
        self.queue.clear();
        (live.len(), futures)
    }

    /// Make `task` RUNNABLE and give it the token, returning its future
    ///
    /// `firing` is the event being fired, or `None` when resuming an
    /// interrupted task from `ready`. Returns `None`, leaving the task
    /// untouched, when it is not in a state that can be resumed that way.
    fn claim(&mut self, task: TaskHandle, firing: Option<(EventHandle, Event)>) -> Option<TaskFuture> {
        let now = self.clock.now();
        let Some(slot) = self.tasks.get_mut(&task) else {
            debug!(task = %task, "skipping resumption of a finished task");
            return None;
        };
        let expected = match &firing {
            Some((handle, _)) => slot.state == TaskState::Waiting && slot.pending == Some(*handle),
            None => slot.state == TaskState::Interrupted,
        };
        if !expected {
            warn!(task = %task, state = %slot.state, "skipping stale resumption");
            return None;
        }
        if slot.future.is_none() {
            warn!(task = %task, "task has no body to resume");
            return None;
        }
        if let Err(e) = slot.transition(task, TaskState::Runnable) {
            warn!(task = %task, error = %e, "skipping resumption");
            return None;
        }

        slot.pending = None;
        if firing.is_some() {
            slot.wakeup = Some(if slot.started { Wakeup::Fired } else { Wakeup::Started });
        }
        slot.started = true;
        let future = slot.future.take();

        debug!(task = %task, tick = now, wakeup = ?slot.wakeup, "resuming task");
        debug_assert!(self.token.is_none(), "hand-off token already held");
        self.token = Some(task);
        self.firing = firing.map(|(_, event)| event);
        future
    }

    /// Cancel a task's pending event, recording why
    fn cancel_pending(&mut self, task: TaskHandle, status: EventStatus) -> Result<(), SchedulerError> {
        let Some(pending) = self.tasks.get(&task).and_then(|slot| slot.pending) else {
            return Ok(());
        };
        if let Some(event) = self.queue.cancel(pending)? {
            self.record(&event, status);
        }
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.pending = None;
        }
        Ok(())
    }
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    stop_requested: AtomicBool,
    next_task: AtomicU64,
    run_id: Uuid,
}

/// Discrete-event scheduler
///
/// Cheap to clone; every clone drives the same simulation. Task bodies
/// receive one through their [`TaskContext`].
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Non-owning reference to a scheduler
#[derive(Clone)]
pub struct WeakScheduler {
    shared: Weak<Shared>,
}

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.shared.upgrade().map(|shared| Scheduler { shared })
    }
}

impl fmt::Debug for WeakScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakScheduler")
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("run_id", &self.shared.run_id)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler from configuration
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidConfig` if the configuration does not validate.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let mut clock = Clock::new(config.ticks_per_time_unit);
        clock.set_real_time_factor(config.real_time_factor);

        let inner = Inner {
            clock,
            pacer: None,
            queue: EventQueue::new(config.priority_order),
            tasks: BTreeMap::new(),
            finished: BTreeMap::new(),
            ready: VecDeque::new(),
            token: None,
            firing: None,
            log: EventLog::new(),
            record_events: config.record_events,
            running: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                stop_requested: AtomicBool::new(false),
                next_task: AtomicU64::new(0),
                run_id: Uuid::new_v4(),
            }),
        })
    }

    // ========================================================================
    // Task control
    // ========================================================================

    /// Create a task that first runs `delay` ticks from now
    ///
    /// The task does not run immediately: its start is queued like any
    /// other wait, at `now() + delay` with `priority`. `method` names the
    /// entity method for attribution until the task calls
    /// [`TaskContext::set_method`].
    #[track_caller]
    pub fn start<F, Fut>(
        &self,
        entity: EntityRef,
        method: &'static str,
        delay: Tick,
        priority: Priority,
        body: F,
    ) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let location = Location::caller();
        let handle = TaskHandle::new(self.shared.next_task.fetch_add(1, Ordering::Relaxed));
        let future: TaskFuture = Box::pin(body(TaskContext::new(self.clone(), handle, entity.clone())));
        let trace = TraceContext::new(method).at(location);

        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        let sched_tick = inner.tick_after(delay)?;
        let now = inner.clock.now();

        let event = Event::new(now, sched_tick, priority, handle, entity.clone(), trace.clone());
        inner.record(&event, EventStatus::Waiting);
        let pending = inner.queue.insert(event);

        let mut slot = TaskSlot::new(entity, future, trace, priority);
        slot.pending = Some(pending);
        inner.tasks.insert(handle, slot);

        debug!(task = %handle, tick = sched_tick, priority, method, "task scheduled");
        Ok(handle)
    }

    /// Same as [`Scheduler::start`]
    #[track_caller]
    pub fn schedule<F, Fut>(
        &self,
        entity: EntityRef,
        method: &'static str,
        delay: Tick,
        priority: Priority,
        body: F,
    ) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.start(entity, method, delay, priority, body)
    }

    /// Cancel a waiting task's event and resume it immediately
    ///
    /// The task transitions to INTERRUPTED at once and is resumed before
    /// any further event fires; its pending `wait_for` returns
    /// `Wakeup::Interrupted`.
    ///
    /// # Errors
    ///
    /// * `DeadTask` - the task has terminated
    /// * `NotWaiting` - the task is running or already interrupted
    /// * `UnknownTask` - the handle is not from this scheduler
    pub fn interrupt(&self, task: TaskHandle) -> Result<(), SchedulerError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        match inner.state_of(task)? {
            TaskState::Waiting => {}
            TaskState::Terminated => return Err(SchedulerError::DeadTask(task)),
            TaskState::Runnable | TaskState::Interrupted => {
                return Err(SchedulerError::NotWaiting(task))
            }
        }

        inner.cancel_pending(task, EventStatus::Interrupted)?;
        if let Some(slot) = inner.tasks.get_mut(&task) {
            slot.transition(task, TaskState::Interrupted)?;
            slot.wakeup = Some(Wakeup::Interrupted);
        }
        inner.ready.push_back(task);

        debug!(task = %task, tick = inner.clock.now(), "task interrupted");
        Ok(())
    }

    /// Terminate a task without running any more of its logic
    ///
    /// A pending event is removed and recorded as "Terminated". Killing the
    /// running task from inside itself takes effect when it next yields.
    ///
    /// # Errors
    ///
    /// * `AlreadyTerminated` - the task had already finished (logged, harmless)
    /// * `UnknownTask` - the handle is not from this scheduler
    pub fn kill(&self, task: TaskHandle) -> Result<(), SchedulerError> {
        let future = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            let state = inner.state_of(task)?;
            if state.is_terminal() {
                warn!(task = %task, "kill requested for a task that already terminated");
                return Err(SchedulerError::AlreadyTerminated(task));
            }

            inner.cancel_pending(task, EventStatus::Terminated)?;
            if state == TaskState::Interrupted {
                inner.ready.retain(|queued| *queued != task);
            }
            let future = inner.finish(task, TaskOutcome::Killed)?;

            debug!(task = %task, from = %state, tick = inner.clock.now(), "task killed");
            future
        };
        drop(future);
        Ok(())
    }

    /// Kill every live task and empty the event list
    ///
    /// Used at model teardown. Returns the number of tasks killed.
    pub fn shutdown(&self) -> usize {
        let (killed, futures) = {
            let mut inner = self.shared.inner.lock();
            let (killed, futures) = inner.kill_all();
            info!(killed, tick = inner.clock.now(), "scheduler shut down");
            (killed, futures)
        };
        drop(futures);
        killed
    }

    /// Kill every live task and rewind the clock to tick 0 for a new run
    ///
    /// The event log, finished-task outcomes and any pending stop request
    /// are cleared; configuration and the real-time factor are kept.
    /// Returns the number of tasks killed.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` while a run loop is active.
    pub fn reset(&self) -> Result<usize, SchedulerError> {
        let (killed, futures) = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if inner.running {
                return Err(SchedulerError::AlreadyRunning);
            }

            let (killed, futures) = inner.kill_all();
            inner.finished.clear();
            inner.log.clear();
            inner.clock.reset();
            inner.reanchor_pacer();
            self.shared.stop_requested.store(false, Ordering::Release);

            info!(killed, "scheduler reset to tick 0");
            (killed, futures)
        };
        drop(futures);
        Ok(killed)
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Run until no events remain or `stop()` is called
    pub fn run(&self) -> Result<RunSummary, SchedulerError> {
        self.run_with(RunLimits::default())
    }

    /// Run until the next event lies beyond `tick`
    ///
    /// On reaching the bound the clock is advanced to `tick`; tasks still
    /// waiting stay WAITING.
    pub fn run_until(&self, tick: Tick) -> Result<RunSummary, SchedulerError> {
        self.run_with(RunLimits {
            until_tick: Some(tick),
            deadline: None,
        })
    }

    /// Run for at most `duration` of wall-clock time
    pub fn run_for(&self, duration: Duration) -> Result<RunSummary, SchedulerError> {
        self.run_with(RunLimits {
            until_tick: None,
            deadline: Some(Instant::now() + duration),
        })
    }

    /// Ask the running loop to return after the current task segment
    ///
    /// Safe to call from any thread or from inside a task. Waiting tasks are
    /// left WAITING.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
    }

    fn run_with(&self, limits: RunLimits) -> Result<RunSummary, SchedulerError> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.running {
                return Err(SchedulerError::AlreadyRunning);
            }
            inner.running = true;
            inner.reanchor_pacer();
        }

        let span = info_span!("run", run_id = %self.shared.run_id);
        let _entered = span.enter();
        info!(tick = self.now(), until = ?limits.until_tick, "run started");

        let result = self.drive(&limits);
        self.shared.inner.lock().running = false;

        match &result {
            Ok(summary) => info!(
                reason = ?summary.reason,
                tick = summary.final_tick,
                fired = summary.events_fired,
                faulted = summary.tasks_faulted,
                "run returned"
            ),
            Err(e) => warn!(error = %e, "run aborted"),
        }
        result
    }

    fn drive(&self, limits: &RunLimits) -> Result<RunSummary, SchedulerError> {
        let mut summary = RunSummary {
            reason: StopReason::Exhausted,
            final_tick: self.now(),
            events_fired: 0,
            resumptions: 0,
            tasks_faulted: 0,
        };

        loop {
            let reason = if self.shared.stop_requested.swap(false, Ordering::AcqRel) {
                Some(StopReason::Stopped)
            } else if limits.deadline_passed() {
                Some(StopReason::WallClockLimit)
            } else {
                match self.next_step(limits)? {
                    Step::Done(reason) => Some(reason),
                    Step::Pace(delay) => {
                        let slice = match limits.deadline {
                            Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
                            None => delay,
                        };
                        std::thread::sleep(slice.min(PACING_SLICE));
                        None
                    }
                    Step::Resume(task, future, fired) => {
                        if fired {
                            summary.events_fired += 1;
                        }
                        summary.resumptions += 1;
                        if self.resume(task, future) {
                            summary.tasks_faulted += 1;
                        }
                        None
                    }
                }
            };

            if let Some(reason) = reason {
                summary.reason = reason;
                summary.final_tick = self.now();
                return Ok(summary);
            }
        }
    }

    /// Pick the next task to resume and claim it, advancing the clock if it
    /// comes from the event list
    fn next_step(&self, limits: &RunLimits) -> Result<Step, SchedulerError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        while let Some(task) = inner.ready.pop_front() {
            if let Some(future) = inner.claim(task, None) {
                return Ok(Step::Resume(task, future, false));
            }
        }

        loop {
            let Some(next_tick) = inner.queue.peek_min_tick() else {
                return Ok(Step::Done(StopReason::Exhausted));
            };

            if let Some(bound) = limits.until_tick {
                if next_tick > bound {
                    if bound > inner.clock.now() {
                        inner.clock.advance_to(bound)?;
                    }
                    return Ok(Step::Done(StopReason::TickLimit));
                }
            }

            if let Some(pacer) = &inner.pacer {
                let delay = pacer.delay_until(inner.clock.to_sim_time(next_tick));
                if !delay.is_zero() {
                    return Ok(Step::Pace(delay));
                }
            }

            let Some((handle, event)) = inner.queue.pop_min() else {
                return Ok(Step::Done(StopReason::Exhausted));
            };
            inner.clock.advance_to(event.sched_tick())?;
            let task = event.task();
            if let Some(future) = inner.claim(task, Some((handle, event))) {
                return Ok(Step::Resume(task, future, true));
            }
        }
    }

    /// Poll a claimed task once. Returns true if it faulted.
    fn resume(&self, task: TaskHandle, mut future: TaskFuture) -> bool {
        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        let (leftover, faulted) = self.settle(task, future, polled);
        drop(leftover);
        faulted
    }

    /// Record how a polled segment ended; returns a future to drop (outside
    /// the lock) and whether the task faulted
    fn settle(
        &self,
        task: TaskHandle,
        future: TaskFuture,
        polled: std::thread::Result<Poll<TaskResult>>,
    ) -> (Option<TaskFuture>, bool) {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;
        inner.token = None;
        let firing = inner.firing.take();

        let Ok(state) = inner.state_of(task) else {
            return (Some(future), false);
        };

        let fault = match polled {
            Ok(Poll::Pending) if matches!(state, TaskState::Waiting | TaskState::Interrupted) => {
                if let Some(slot) = inner.tasks.get_mut(&task) {
                    slot.future = Some(future);
                }
                if let Some(event) = &firing {
                    inner.record(event, EventStatus::RanNormally);
                }
                return (None, false);
            }
            _ if state.is_terminal() => {
                // killed from inside its own segment
                if let Some(event) = &firing {
                    inner.record(event, EventStatus::Terminated);
                }
                return (Some(future), false);
            }
            Ok(Poll::Pending) => TaskFault::SuspendedOutsideWait,
            Ok(Poll::Ready(Ok(()))) => {
                if let Some(event) = &firing {
                    inner.record(event, EventStatus::RanNormally);
                }
                // a wait registered but never awaited to completion
                if let Err(e) = inner.cancel_pending(task, EventStatus::Terminated) {
                    debug!(task = %task, error = %e, "completed task had no cancellable event");
                }
                inner.ready.retain(|queued| *queued != task);
                if let Err(e) = inner.finish(task, TaskOutcome::Completed) {
                    warn!(task = %task, error = %e, "could not complete task");
                }
                debug!(task = %task, tick = inner.clock.now(), "task completed");
                return (Some(future), false);
            }
            Ok(Poll::Ready(Err(fault))) => fault,
            Err(payload) => TaskFault::Panicked(panic_message(payload.as_ref())),
        };

        let detail = fault.to_string();
        warn!(task = %task, tick = inner.clock.now(), error = %detail, "task faulted");

        if let Err(e) = inner.cancel_pending(task, EventStatus::Terminated) {
            debug!(task = %task, error = %e, "faulted task had no cancellable event");
        }
        inner.ready.retain(|queued| *queued != task);

        if inner.record_events {
            let record = match &firing {
                Some(event) => Some(EventRecord::from_event(event, &inner.clock, EventStatus::Faulted)),
                None => inner.synthesized_record(task, EventStatus::Faulted),
            };
            if let Some(record) = record {
                inner.log.log(record.with_fault(detail.clone()));
            }
        }

        if let Err(e) = inner.finish(task, TaskOutcome::Faulted(detail)) {
            warn!(task = %task, error = %e, "could not terminate faulted task");
        }
        (Some(future), true)
    }

    // ========================================================================
    // Calls made by TaskContext / WaitFor
    // ========================================================================

    /// Suspend the running `task` until its new event fires
    pub(crate) fn register_wait(
        &self,
        task: TaskHandle,
        target: WaitTarget,
        priority: Priority,
        location: &'static Location<'static>,
    ) -> Result<(), SchedulerError> {
        let mut guard = self.shared.inner.lock();
        let inner = &mut *guard;

        if inner.state_of(task)?.is_terminal() {
            return Err(SchedulerError::DeadTask(task));
        }
        if inner.token != Some(task) {
            return Err(SchedulerError::NotRunnable(task));
        }

        let now = inner.clock.now();
        let sched_tick = match target {
            WaitTarget::Delay(delay) => inner.tick_after(delay)?,
            WaitTarget::At(tick) if tick < now => {
                return Err(ClockError::Regression {
                    current: now,
                    requested: tick,
                }
                .into())
            }
            WaitTarget::At(tick) => tick,
        };

        let Some(slot) = inner.tasks.get_mut(&task) else {
            return Err(SchedulerError::UnknownTask(task));
        };
        slot.transition(task, TaskState::Waiting)?;
        slot.trace = slot.trace.at(location);
        slot.last_priority = priority;
        slot.wakeup = None;
        let event = Event::new(now, sched_tick, priority, task, slot.entity.clone(), slot.trace.clone());

        inner.record(&event, EventStatus::Waiting);
        let pending = inner.queue.insert(event);
        if let Some(slot) = inner.tasks.get_mut(&task) {
            slot.pending = Some(pending);
        }

        debug!(task = %task, now, tick = sched_tick, priority, "task waiting");
        Ok(())
    }

    /// Why `task` was resumed, once it holds the token again
    pub(crate) fn resumed_with(&self, task: TaskHandle) -> Option<Wakeup> {
        let inner = self.shared.inner.lock();
        let slot = inner.tasks.get(&task)?;
        if slot.state == TaskState::Runnable {
            slot.wakeup
        } else {
            None
        }
    }

    pub(crate) fn set_task_method(&self, task: TaskHandle, method: Cow<'static, str>) {
        if let Some(slot) = self.shared.inner.lock().tasks.get_mut(&task) {
            slot.trace.set_method(method);
        }
    }

    /// Non-blocking read of a task's attribution, for the trace hook
    pub(crate) fn try_task_trace(&self, task: TaskHandle) -> Option<(EntityRef, TraceContext)> {
        let inner = self.shared.inner.try_lock()?;
        let slot = inner.tasks.get(&task)?;
        Some((slot.entity.clone(), slot.trace.clone()))
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // ========================================================================
    // Clock access
    // ========================================================================

    /// Current tick
    pub fn now(&self) -> Tick {
        self.shared.inner.lock().clock.now()
    }

    /// Convert a tick to simulated time units
    pub fn to_sim_time(&self, tick: Tick) -> f64 {
        self.shared.inner.lock().clock.to_sim_time(tick)
    }

    /// Convert simulated time units to the nearest tick
    pub fn to_tick(&self, sim_time: f64) -> Tick {
        self.shared.inner.lock().clock.to_tick(sim_time)
    }

    /// Pace playback against the wall clock, or run flat out with `None`
    ///
    /// `factor` is simulated time units per wall-clock second.
    pub fn set_real_time_factor(&self, factor: Option<f64>) -> Result<(), SchedulerError> {
        if let Some(f) = factor {
            if !(f.is_finite() && f > 0.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "real_time_factor must be positive and finite, got {}",
                    f
                )));
            }
        }
        let mut inner = self.shared.inner.lock();
        inner.clock.set_real_time_factor(factor);
        inner.reanchor_pacer();
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current state of a task
    pub fn task_state(&self, task: TaskHandle) -> Result<TaskState, SchedulerError> {
        self.shared.inner.lock().state_of(task)
    }

    /// How a task ended, once it has terminated
    pub fn task_outcome(&self, task: TaskHandle) -> Option<TaskOutcome> {
        self.shared
            .inner
            .lock()
            .finished
            .get(&task)
            .map(|done| done.outcome.clone())
    }

    /// The states a task has been in, oldest first
    ///
    /// Only the last [`HISTORY_LIMIT`](crate::models::task::HISTORY_LIMIT)
    /// states are kept.
    pub fn task_history(&self, task: TaskHandle) -> Vec<TaskState> {
        let inner = self.shared.inner.lock();
        let history = match inner.tasks.get(&task) {
            Some(slot) => &slot.history,
            None => match inner.finished.get(&task) {
                Some(done) => &done.history,
                None => return Vec::new(),
            },
        };
        history.iter().copied().collect()
    }

    /// Task currently holding the hand-off token
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.shared.inner.lock().token
    }

    /// Number of tasks in the RUNNABLE state (never more than one)
    pub fn runnable_tasks(&self) -> usize {
        self.shared
            .inner
            .lock()
            .tasks
            .values()
            .filter(|slot| slot.state == TaskState::Runnable)
            .count()
    }

    /// Number of events not yet fired
    pub fn pending_events(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// "Waiting" records for every pending event, in firing order
    pub fn pending_records(&self) -> Vec<EventRecord> {
        let inner = self.shared.inner.lock();
        inner
            .queue
            .iter()
            .map(|(_, event)| EventRecord::from_event(event, &inner.clock, EventStatus::Waiting))
            .collect()
    }

    /// Number of tasks that have not terminated
    pub fn live_tasks(&self) -> usize {
        self.shared.inner.lock().tasks.len()
    }

    /// Copy of the event log
    pub fn event_log(&self) -> EventLog {
        self.shared.inner.lock().log.clone()
    }

    /// Take the event log, leaving it empty
    ///
    /// Long runs with `record_events` on can call this between
    /// `run_until` slices to keep memory flat.
    pub fn take_event_log(&self) -> EventLog {
        std::mem::take(&mut self.shared.inner.lock().log)
    }

    /// Attribution hook for monitors
    pub fn trace_hook(&self) -> TraceHook {
        TraceHook::new(self.downgrade())
    }

    /// Unique id of this simulation run
    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    /// Whether a run loop is active
    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().running
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

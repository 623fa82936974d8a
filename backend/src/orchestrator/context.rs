//! Handle given to every task body
//!
//! [`TaskContext::wait_for`] is the only suspension point a task has. The
//! returned [`WaitFor`] registers the wait with the scheduler the first time
//! it is polled, yields, and completes once the scheduler hands the token
//! back to this task.
//!
//! ```rust
//! use sim_kernel_core::{NamedEntity, Scheduler, SchedulerConfig, Wakeup};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
//! scheduler
//!     .start(NamedEntity::shared("Press"), "cycle", 0, 0, |ctx| async move {
//!         for _ in 0..3 {
//!             let wakeup = ctx.wait_for(100, 0).await?;
//!             assert_eq!(wakeup, Wakeup::Fired);
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! scheduler.run().unwrap();
//! assert_eq!(scheduler.now(), 300);
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::core::clock::Tick;
use crate::models::entity::EntityRef;
use crate::models::event::Priority;
use crate::models::task::{TaskHandle, Wakeup};
use crate::orchestrator::engine::{Scheduler, SchedulerError};

/// When a wait should end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    /// Ticks from now
    Delay(Tick),
    /// Absolute tick, not before now
    At(Tick),
}

/// A task's view of the scheduler
#[derive(Debug, Clone)]
pub struct TaskContext {
    scheduler: Scheduler,
    task: TaskHandle,
    entity: EntityRef,
}

impl TaskContext {
    pub(crate) fn new(scheduler: Scheduler, task: TaskHandle, entity: EntityRef) -> Self {
        Self {
            scheduler,
            task,
            entity,
        }
    }

    /// This task's handle
    pub fn handle(&self) -> TaskHandle {
        self.task
    }

    /// Entity the task acts on behalf of
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// The scheduler driving this task
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn now(&self) -> Tick {
        self.scheduler.now()
    }

    pub fn sim_time(&self) -> f64 {
        self.scheduler.to_sim_time(self.scheduler.now())
    }

    /// Why this task was last resumed
    pub fn wakeup(&self) -> Option<Wakeup> {
        self.scheduler.resumed_with(self.task)
    }

    /// Name the entity method the task is now executing
    ///
    /// Shows up in event records and trace descriptions from the next wait on.
    pub fn set_method(&self, method: impl Into<Cow<'static, str>>) {
        self.scheduler.set_task_method(self.task, method.into());
    }

    /// Suspend for `delay` ticks
    ///
    /// Resolves to `Wakeup::Fired` when the event fires, or
    /// `Wakeup::Interrupted` if another task interrupted the wait. Errors
    /// if the target tick would overflow.
    #[track_caller]
    pub fn wait_for(&self, delay: Tick, priority: Priority) -> WaitFor {
        self.wait(WaitTarget::Delay(delay), priority)
    }

    /// Suspend until the absolute `tick`; errors if `tick` is in the past
    #[track_caller]
    pub fn wait_until(&self, tick: Tick, priority: Priority) -> WaitFor {
        self.wait(WaitTarget::At(tick), priority)
    }

    /// Suspend for `duration` simulated time units
    #[track_caller]
    pub fn wait_sim_time(&self, duration: f64, priority: Priority) -> WaitFor {
        let delay = self.scheduler.to_tick(duration);
        self.wait(WaitTarget::Delay(delay), priority)
    }

    #[track_caller]
    fn wait(&self, target: WaitTarget, priority: Priority) -> WaitFor {
        WaitFor {
            scheduler: self.scheduler.clone(),
            task: self.task,
            target,
            priority,
            location: Location::caller(),
            registered: false,
        }
    }
}

/// Future returned by the `wait_*` methods of [`TaskContext`]
#[must_use = "a wait does nothing unless awaited"]
#[derive(Debug)]
pub struct WaitFor {
    scheduler: Scheduler,
    task: TaskHandle,
    target: WaitTarget,
    priority: Priority,
    location: &'static Location<'static>,
    registered: bool,
}

impl Future for WaitFor {
    type Output = Result<Wakeup, SchedulerError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.registered {
            this.scheduler
                .register_wait(this.task, this.target, this.priority, this.location)?;
            this.registered = true;
            return Poll::Pending;
        }
        match this.scheduler.resumed_with(this.task) {
            Some(wakeup) => Poll::Ready(Ok(wakeup)),
            None => Poll::Pending,
        }
    }
}

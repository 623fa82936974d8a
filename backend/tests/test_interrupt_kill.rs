//! Interrupting and killing tasks

use std::sync::Arc;

use parking_lot::Mutex;
use sim_kernel_core::models::task::HISTORY_LIMIT;
use sim_kernel_core::{
    EventStatus, NamedEntity, Scheduler, SchedulerConfig, SchedulerError, TaskFault, TaskHandle,
    TaskOutcome, TaskState, Tick, Wakeup,
};
use tracing_test::traced_test;

fn scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::default()).unwrap()
}

/// A task that waits `delay` once and records how it woke up
fn sleeper(scheduler: &Scheduler, delay: Tick, woke: Arc<Mutex<Option<(Wakeup, Tick)>>>) -> TaskHandle {
    scheduler
        .start(NamedEntity::shared("Sleeper"), "sleep", 0, 0, move |ctx| async move {
            let wakeup = ctx.wait_for(delay, 0).await?;
            *woke.lock() = Some((wakeup, ctx.now()));
            Ok(())
        })
        .unwrap()
}

/// A task that runs `action` against `target` at tick `at`
fn actor<F>(scheduler: &Scheduler, at: Tick, action: F) -> TaskHandle
where
    F: FnOnce(&Scheduler) -> Result<(), SchedulerError> + Send + 'static,
{
    scheduler
        .start(NamedEntity::shared("Actor"), "act", at, 0, move |ctx| async move {
            action(ctx.scheduler())?;
            Ok(())
        })
        .unwrap()
}

// =============================================================================
// Interrupt
// =============================================================================

#[test]
fn test_interrupt_resumes_task_immediately() {
    let scheduler = scheduler();
    let woke = Arc::new(Mutex::new(None));
    let target = sleeper(&scheduler, 1_000, woke.clone());
    actor(&scheduler, 10, move |s| s.interrupt(target));

    let summary = scheduler.run().unwrap();
    assert_eq!(*woke.lock(), Some((Wakeup::Interrupted, 10)));
    assert_eq!(summary.final_tick, 10);
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Completed));
    assert_eq!(
        scheduler.task_history(target),
        vec![
            TaskState::Waiting,
            TaskState::Runnable,
            TaskState::Waiting,
            TaskState::Interrupted,
            TaskState::Runnable,
            TaskState::Terminated
        ]
    );
}

#[test]
fn test_interrupted_wait_never_fires() {
    let scheduler = scheduler();
    let woke = Arc::new(Mutex::new(None));
    let target = sleeper(&scheduler, 100, woke.clone());
    actor(&scheduler, 50, move |s| s.interrupt(target));

    let summary = scheduler.run().unwrap();
    assert_eq!(*woke.lock(), Some((Wakeup::Interrupted, 50)));
    // the tick-100 event was removed, so the clock never got there
    assert_eq!(summary.final_tick, 50);
    let log = scheduler.event_log();
    assert!(log
        .records_at_tick(100)
        .iter()
        .all(|r| r.status != EventStatus::RanNormally));
}

#[test]
fn test_interrupted_task_runs_before_same_tick_events() {
    let scheduler = scheduler();
    let trail = Arc::new(Mutex::new(Vec::new()));

    let sleeper_trail = trail.clone();
    let target = scheduler
        .start(NamedEntity::shared("Sleeper"), "sleep", 0, 0, move |ctx| async move {
            ctx.wait_for(1_000, 0).await?;
            sleeper_trail.lock().push("sleeper");
            Ok(())
        })
        .unwrap();

    actor(&scheduler, 10, move |s| s.interrupt(target));

    let bystander_trail = trail.clone();
    scheduler
        .start(NamedEntity::shared("Bystander"), "run", 10, 0, move |_ctx| async move {
            bystander_trail.lock().push("bystander");
            Ok(())
        })
        .unwrap();

    scheduler.run().unwrap();
    assert_eq!(*trail.lock(), vec!["sleeper", "bystander"]);
}

#[test]
fn test_interrupt_records_cancelled_event() {
    let scheduler = scheduler();
    let target = sleeper(&scheduler, 1_000, Arc::default());
    actor(&scheduler, 10, move |s| s.interrupt(target));

    scheduler.run().unwrap();
    let log = scheduler.event_log();
    let interrupted = log.records_with_status(EventStatus::Interrupted);
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].sched_tick, 1_000);
    assert_eq!(interrupted[0].caller_name, "Sleeper");
}

#[test]
fn test_interrupt_requires_waiting_state() {
    let scheduler = scheduler();
    let results = Arc::new(Mutex::new(Vec::new()));

    let log = results.clone();
    let target = scheduler
        .start(NamedEntity::shared("Self"), "run", 0, 0, move |ctx| async move {
            // a running task is not waiting
            log.lock().push(ctx.scheduler().interrupt(ctx.handle()));
            ctx.wait_for(100, 0).await?;
            Ok(())
        })
        .unwrap();

    let log = results.clone();
    actor(&scheduler, 5, move |s| {
        log.lock().push(s.interrupt(target));
        log.lock().push(s.interrupt(target));
        Ok(())
    });

    scheduler.run().unwrap();
    assert_eq!(
        *results.lock(),
        vec![
            Err(SchedulerError::NotWaiting(target)),
            Ok(()),
            Err(SchedulerError::NotWaiting(target)),
        ]
    );
}

#[test]
fn test_interrupt_terminated_task_is_dead() {
    let scheduler = scheduler();
    let done = scheduler
        .start(NamedEntity::shared("Done"), "run", 0, 0, |_ctx| async { Ok(()) })
        .unwrap();
    scheduler.run().unwrap();

    assert_eq!(scheduler.interrupt(done), Err(SchedulerError::DeadTask(done)));
}

#[test]
fn test_interrupt_before_first_run() {
    let scheduler = scheduler();
    let seen = Arc::new(Mutex::new(None));
    let log = seen.clone();
    let task = scheduler
        .start(NamedEntity::shared("Fresh"), "run", 500, 0, move |ctx| async move {
            *log.lock() = Some((ctx.wakeup(), ctx.now()));
            Ok(())
        })
        .unwrap();

    scheduler.interrupt(task).unwrap();
    assert_eq!(scheduler.task_state(task), Ok(TaskState::Interrupted));
    assert_eq!(scheduler.pending_events(), 0);

    scheduler.run().unwrap();
    assert_eq!(*seen.lock(), Some((Some(Wakeup::Interrupted), 0)));
}

// =============================================================================
// Kill
// =============================================================================

#[test]
fn test_kill_waiting_task() {
    let scheduler = scheduler();
    let woke = Arc::new(Mutex::new(None));
    let target = sleeper(&scheduler, 1_000, woke.clone());
    actor(&scheduler, 10, move |s| s.kill(target));

    let summary = scheduler.run().unwrap();
    assert_eq!(*woke.lock(), None);
    assert_eq!(summary.final_tick, 10);
    assert_eq!(scheduler.task_state(target), Ok(TaskState::Terminated));
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Killed));

    let log = scheduler.event_log();
    let terminated = log.records_with_status(EventStatus::Terminated);
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].sched_tick, 1_000);
}

#[test]
fn test_kill_interrupted_task_before_it_resumes() {
    let scheduler = scheduler();
    let woke = Arc::new(Mutex::new(None));
    let target = sleeper(&scheduler, 1_000, woke.clone());
    actor(&scheduler, 10, move |s| {
        s.interrupt(target)?;
        s.kill(target)
    });

    scheduler.run().unwrap();
    assert_eq!(*woke.lock(), None);
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Killed));
    assert_eq!(
        scheduler.task_history(target).last(),
        Some(&TaskState::Terminated)
    );
}

#[test]
fn test_self_kill_takes_effect_at_next_wait() {
    let scheduler = scheduler();
    let reached = Arc::new(Mutex::new(Vec::new()));

    let log = reached.clone();
    let task = scheduler
        .start(NamedEntity::shared("Quitter"), "run", 0, 0, move |ctx| async move {
            ctx.scheduler().kill(ctx.handle())?;
            log.lock().push("after kill");
            ctx.wait_for(10, 0).await?;
            log.lock().push("after wait");
            Ok(())
        })
        .unwrap();

    scheduler.run().unwrap();
    assert_eq!(*reached.lock(), vec!["after kill"]);
    assert_eq!(scheduler.task_outcome(task), Some(TaskOutcome::Killed));
    assert_eq!(scheduler.now(), 0);
}

#[test]
#[traced_test]
fn test_double_kill_is_reported_and_logged() {
    let scheduler = scheduler();
    let target = sleeper(&scheduler, 1_000, Arc::default());

    scheduler.kill(target).unwrap();
    assert_eq!(
        scheduler.kill(target),
        Err(SchedulerError::AlreadyTerminated(target))
    );
    assert!(logs_contain("kill requested for a task that already terminated"));
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Killed));
}

#[test]
fn test_shutdown_kills_every_live_task() {
    let scheduler = scheduler();
    let tasks: Vec<_> = (0..3)
        .map(|i| sleeper(&scheduler, 100 * (i + 1), Arc::default()))
        .collect();
    scheduler.run_until(50).unwrap();

    assert_eq!(scheduler.shutdown(), 3);
    assert_eq!(scheduler.pending_events(), 0);
    for task in tasks {
        assert_eq!(scheduler.task_outcome(task), Some(TaskOutcome::Killed));
    }
    assert_eq!(scheduler.shutdown(), 0);
}

#[test]
fn test_long_lived_task_keeps_bounded_state() {
    let scheduler = Scheduler::new(SchedulerConfig::default().with_record_events(false)).unwrap();
    let target = scheduler
        .start(NamedEntity::shared("Looper"), "run", 0, 0, |ctx| async move {
            for _ in 0..5_000 {
                ctx.wait_for(1, 0).await?;
            }
            Ok(())
        })
        .unwrap();

    let longest = Arc::new(Mutex::new(0));
    let seen = longest.clone();
    scheduler
        .start(NamedEntity::shared("Nudger"), "run", 0, 0, move |ctx| async move {
            for _ in 0..1_000 {
                ctx.wait_for(3, 0).await?;
                match ctx.scheduler().interrupt(target) {
                    Ok(()) | Err(SchedulerError::DeadTask(_)) => {}
                    Err(e) => return Err(TaskFault::from(e)),
                }
                let mut longest = seen.lock();
                *longest = (*longest).max(ctx.scheduler().task_history(target).len());
            }
            Ok(())
        })
        .unwrap();

    let summary = scheduler.run().unwrap();
    assert_eq!(summary.tasks_faulted, 0);
    assert_eq!(*longest.lock(), HISTORY_LIMIT);
    assert_eq!(scheduler.live_tasks(), 0);
    assert_eq!(scheduler.pending_events(), 0);

    let history = scheduler.task_history(target);
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history.last(), Some(&TaskState::Terminated));
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Completed));
    assert!(scheduler.event_log().is_empty());
}

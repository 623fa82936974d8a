//! Stopping, bounding and pacing a run

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sim_kernel_core::{
    EventStatus, NamedEntity, Scheduler, SchedulerConfig, SchedulerError, StopReason, TaskOutcome,
    TaskState, Wakeup,
};

fn scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::default()).unwrap()
}

#[test]
fn test_stop_from_inside_a_task() {
    let scheduler = scheduler();
    let stopper = scheduler
        .start(NamedEntity::shared("Stopper"), "run", 10, 0, |ctx| async move {
            ctx.scheduler().stop();
            Ok(())
        })
        .unwrap();
    let later = scheduler
        .start(NamedEntity::shared("Later"), "run", 20, 0, |_ctx| async { Ok(()) })
        .unwrap();

    let summary = scheduler.run().unwrap();
    assert_eq!(summary.reason, StopReason::Stopped);
    assert_eq!(summary.final_tick, 10);
    assert_eq!(scheduler.task_outcome(stopper), Some(TaskOutcome::Completed));
    assert_eq!(scheduler.task_state(later), Ok(TaskState::Waiting));

    // a fresh run picks up where the stopped one left off
    let summary = scheduler.run().unwrap();
    assert_eq!(summary.reason, StopReason::Exhausted);
    assert_eq!(summary.final_tick, 20);
    assert_eq!(scheduler.task_outcome(later), Some(TaskOutcome::Completed));
}

#[test]
fn test_stop_before_run_returns_at_once() {
    let scheduler = scheduler();
    scheduler
        .start(NamedEntity::shared("A"), "run", 10, 0, |_ctx| async { Ok(()) })
        .unwrap();

    scheduler.stop();
    let summary = scheduler.run().unwrap();
    assert_eq!(summary.reason, StopReason::Stopped);
    assert_eq!(summary.events_fired, 0);
    assert_eq!(scheduler.pending_events(), 1);
}

#[test]
fn test_run_until_leaves_tasks_waiting() {
    let scheduler = scheduler();
    let ticks = Arc::new(Mutex::new(Vec::new()));

    let log = ticks.clone();
    let task = scheduler
        .start(NamedEntity::shared("Ticker"), "run", 0, 0, move |ctx| async move {
            loop {
                log.lock().push(ctx.now());
                ctx.wait_for(100, 0).await?;
            }
        })
        .unwrap();

    let summary = scheduler.run_until(350).unwrap();
    assert_eq!(summary.reason, StopReason::TickLimit);
    assert_eq!(*ticks.lock(), vec![0, 100, 200, 300]);
    assert_eq!(scheduler.now(), 350);
    assert_eq!(scheduler.task_state(task), Ok(TaskState::Waiting));

    scheduler.run_until(500).unwrap();
    assert_eq!(*ticks.lock(), vec![0, 100, 200, 300, 400, 500]);
}

#[test]
fn test_nested_run_is_rejected() {
    let scheduler = scheduler();
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    scheduler
        .start(NamedEntity::shared("Nested"), "run", 0, 0, move |ctx| async move {
            *slot.lock() = Some(ctx.scheduler().run_until(10));
            Ok(())
        })
        .unwrap();

    scheduler.run().unwrap();
    assert_eq!(*result.lock(), Some(Err(SchedulerError::AlreadyRunning)));
    assert!(!scheduler.is_running());
}

#[test]
fn test_real_time_pacing_delays_events() {
    // 100 time units per second: tick 5000 is 50 ms of wall clock
    let config = SchedulerConfig::default().with_real_time_factor(100.0);
    let scheduler = Scheduler::new(config).unwrap();
    scheduler
        .start(NamedEntity::shared("Paced"), "run", 5_000, 0, |_ctx| async { Ok(()) })
        .unwrap();

    let started = Instant::now();
    scheduler.run().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(scheduler.now(), 5_000);
}

#[test]
fn test_run_for_gives_up_on_wall_clock() {
    let config = SchedulerConfig::default().with_real_time_factor(1.0);
    let scheduler = Scheduler::new(config).unwrap();
    scheduler
        .start(NamedEntity::shared("Distant"), "run", 60_000, 0, |_ctx| async { Ok(()) })
        .unwrap();

    let summary = scheduler.run_for(Duration::from_millis(80)).unwrap();
    assert_eq!(summary.reason, StopReason::WallClockLimit);
    assert_eq!(scheduler.now(), 0);
    assert_eq!(scheduler.pending_events(), 1);

    // switching pacing off lets the rest run flat out
    scheduler.set_real_time_factor(None).unwrap();
    let summary = scheduler.run().unwrap();
    assert_eq!(summary.reason, StopReason::Exhausted);
    assert_eq!(scheduler.now(), 60_000);
}

#[test]
fn test_stop_from_another_thread_interrupts_pacing() {
    let config = SchedulerConfig::default().with_real_time_factor(1.0);
    let scheduler = Scheduler::new(config).unwrap();
    scheduler
        .start(NamedEntity::shared("Distant"), "run", 60_000, 0, |_ctx| async { Ok(()) })
        .unwrap();

    let remote = scheduler.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        remote.stop();
    });

    let started = Instant::now();
    let summary = scheduler.run().unwrap();
    stopper.join().unwrap();

    assert_eq!(summary.reason, StopReason::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(scheduler.now(), 0);
}

// =============================================================================
// Control from other threads
// =============================================================================

#[test]
fn test_interrupts_from_another_thread_never_fault_the_target() {
    const STEPS: u64 = 20_000;
    let scheduler = scheduler();
    let interrupted = Arc::new(AtomicU64::new(0));
    let regressions = Arc::new(AtomicU64::new(0));

    let woke = interrupted.clone();
    let back = regressions.clone();
    let target = scheduler
        .start(NamedEntity::shared("Looper"), "run", 0, 0, move |ctx| async move {
            let mut last = ctx.now();
            for _ in 0..STEPS {
                if ctx.wait_for(1, 0).await? == Wakeup::Interrupted {
                    woke.fetch_add(1, Ordering::Relaxed);
                }
                if ctx.now() < last {
                    back.fetch_add(1, Ordering::Relaxed);
                }
                last = ctx.now();
            }
            Ok(())
        })
        .unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let remote = scheduler.clone();
    let done = finished.clone();
    let interrupter = thread::spawn(move || {
        // leave the start event alone so every interrupt lands on a wait
        while remote.task_history(target).len() < 2 {
            thread::yield_now();
        }
        let mut accepted = 0u64;
        while !done.load(Ordering::Acquire) {
            if remote.interrupt(target).is_ok() {
                accepted += 1;
            }
        }
        accepted
    });

    let summary = scheduler.run().unwrap();
    finished.store(true, Ordering::Release);
    let accepted = interrupter.join().unwrap();

    assert_eq!(summary.reason, StopReason::Exhausted);
    assert_eq!(summary.tasks_faulted, 0);
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Completed));
    // every accepted interrupt was observed by exactly one wait
    assert_eq!(interrupted.load(Ordering::Relaxed), accepted);
    assert_eq!(regressions.load(Ordering::Relaxed), 0);
    assert_eq!(summary.final_tick, STEPS - accepted);
}

#[test]
fn test_kill_from_another_thread_while_task_waits() {
    let config = SchedulerConfig::default().with_real_time_factor(1.0);
    let scheduler = Scheduler::new(config).unwrap();
    let reached = Arc::new(AtomicBool::new(false));

    let after_wait = reached.clone();
    let target = scheduler
        .start(NamedEntity::shared("Sleeper"), "run", 0, 0, move |ctx| async move {
            // sixty seconds of wall-clock time at this factor
            ctx.wait_for(60_000, 0).await?;
            after_wait.store(true, Ordering::Release);
            Ok(())
        })
        .unwrap();

    let remote = scheduler.clone();
    let killer = thread::spawn(move || {
        // WAITING, RUNNABLE, WAITING: started and parked on its long wait
        while remote.task_history(target).len() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        // and its first segment has settled
        while remote.current_task().is_some() {
            thread::sleep(Duration::from_millis(1));
        }
        let state = remote.task_state(target);
        (state, remote.kill(target))
    });

    let started = Instant::now();
    let summary = scheduler.run_for(Duration::from_secs(10)).unwrap();
    let (state_at_kill, killed) = killer.join().unwrap();

    assert_eq!(state_at_kill, Ok(TaskState::Waiting));
    assert_eq!(killed, Ok(()));
    assert_eq!(summary.reason, StopReason::Exhausted);
    assert_eq!(summary.tasks_faulted, 0);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!reached.load(Ordering::Acquire));
    assert_eq!(scheduler.now(), 0);
    assert_eq!(scheduler.pending_events(), 0);
    assert_eq!(scheduler.task_outcome(target), Some(TaskOutcome::Killed));

    let log = scheduler.event_log();
    let terminated = log.records_with_status(EventStatus::Terminated);
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].sched_tick, 60_000);
}

// =============================================================================
// Reset
// =============================================================================

#[test]
fn test_reset_rewinds_for_a_new_run() {
    let scheduler = scheduler();
    let done = scheduler
        .start(NamedEntity::shared("First"), "run", 40, 0, |_ctx| async { Ok(()) })
        .unwrap();
    scheduler
        .start(NamedEntity::shared("Waiter"), "run", 0, 0, |ctx| async move {
            ctx.wait_for(1_000, 0).await?;
            Ok(())
        })
        .unwrap();
    scheduler.run_until(100).unwrap();
    assert_eq!(scheduler.now(), 100);

    assert_eq!(scheduler.reset(), Ok(1));
    assert_eq!(scheduler.now(), 0);
    assert_eq!(scheduler.pending_events(), 0);
    assert_eq!(scheduler.live_tasks(), 0);
    assert!(scheduler.event_log().is_empty());
    assert_eq!(scheduler.task_state(done), Err(SchedulerError::UnknownTask(done)));

    let again = scheduler
        .start(NamedEntity::shared("Second"), "run", 5, 0, |_ctx| async { Ok(()) })
        .unwrap();
    let summary = scheduler.run().unwrap();
    assert_eq!(summary.final_tick, 5);
    assert_eq!(scheduler.task_outcome(again), Some(TaskOutcome::Completed));
}

#[test]
fn test_reset_is_refused_while_running() {
    let scheduler = scheduler();
    let seen = Arc::new(Mutex::new(None));

    let log = seen.clone();
    scheduler
        .start(NamedEntity::shared("Resetter"), "run", 3, 0, move |ctx| async move {
            *log.lock() = Some(ctx.scheduler().reset());
            Ok(())
        })
        .unwrap();

    scheduler.run().unwrap();
    assert_eq!(*seen.lock(), Some(Err(SchedulerError::AlreadyRunning)));
    assert_eq!(scheduler.now(), 3);
}

//! Workshop demo model
//!
//! A row of machines turns out parts. Each part takes a random service
//! time and a machine occasionally breaks down and waits for repair. An
//! inspector walks the floor at a fixed interval and interrupts one machine
//! at random; the interrupted machine spends a short while being inspected
//! and then carries on.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sim_kernel_core::{
    DelayRng, NamedEntity, Scheduler, SchedulerError, TaskContext, TaskHandle, TaskResult, Tick,
    Wakeup,
};
use tracing::debug;

/// Model parameters, in simulated time units
#[derive(Debug, Clone)]
pub struct WorkshopParams {
    pub machines: usize,
    pub seed: u64,
    pub min_service: f64,
    pub max_service: f64,
    pub breakdown_chance: f64,
    pub mean_repair: f64,
    pub inspection_interval: f64,
    pub inspection_time: f64,
}

impl Default for WorkshopParams {
    fn default() -> Self {
        Self {
            machines: 3,
            seed: 42,
            min_service: 2.0,
            max_service: 5.0,
            breakdown_chance: 0.1,
            mean_repair: 8.0,
            inspection_interval: 15.0,
            inspection_time: 1.0,
        }
    }
}

/// Per-machine counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MachineStats {
    pub name: String,
    pub parts: u64,
    pub breakdowns: u64,
    pub inspections: u64,
}

pub type SharedStats = Arc<Mutex<Vec<MachineStats>>>;

/// Schedule every machine and the inspector; returns the shared counters
pub fn build(scheduler: &Scheduler, params: &WorkshopParams) -> Result<SharedStats, SchedulerError> {
    let mut rng = DelayRng::new(params.seed);
    let stats: SharedStats = Arc::new(Mutex::new(
        (0..params.machines)
            .map(|i| MachineStats {
                name: format!("Machine{}", i + 1),
                ..Default::default()
            })
            .collect(),
    ));

    let mut machines = Vec::with_capacity(params.machines);
    for index in 0..params.machines {
        let entity = NamedEntity::new(format!("Machine{}", index + 1))
            .with_input_name(format!("machine_{}", index + 1))
            .with_type_name("Machine")
            .into_ref();
        let rng = rng.fork();
        let stats = stats.clone();
        let params = params.clone();
        let handle = scheduler.start(entity, "startUp", 0, 1, move |ctx| {
            machine(ctx, index, params, rng, stats)
        })?;
        machines.push(handle);
    }

    if !machines.is_empty() {
        let entity = NamedEntity::new("Inspector")
            .with_type_name("Inspector")
            .into_ref();
        let rng = rng.fork();
        let interval = scheduler.to_tick(params.inspection_interval);
        scheduler.start(entity, "startUp", interval, 0, move |ctx| {
            inspector(ctx, machines, interval, rng)
        })?;
    }

    Ok(stats)
}

async fn machine(
    ctx: TaskContext,
    index: usize,
    params: WorkshopParams,
    mut rng: DelayRng,
    stats: SharedStats,
) -> TaskResult {
    let min_service = ctx.scheduler().to_tick(params.min_service);
    let max_service = ctx.scheduler().to_tick(params.max_service).max(min_service + 1);
    let mean_repair = params.mean_repair * ctx.scheduler().to_tick(1.0) as f64;

    loop {
        ctx.set_method("work");
        let service = rng.uniform_ticks(min_service, max_service);
        if ctx.wait_for(service, 1).await? == Wakeup::Interrupted {
            inspect(&ctx, &params, &stats, index).await?;
            continue;
        }
        stats.lock()[index].parts += 1;

        if rng.chance(params.breakdown_chance) {
            ctx.set_method("repair");
            stats.lock()[index].breakdowns += 1;
            debug!(machine = index + 1, tick = ctx.now(), "breakdown");
            if ctx.wait_for(rng.exponential_ticks(mean_repair), 1).await? == Wakeup::Interrupted {
                inspect(&ctx, &params, &stats, index).await?;
            }
        }
    }
}

async fn inspect(
    ctx: &TaskContext,
    params: &WorkshopParams,
    stats: &SharedStats,
    index: usize,
) -> TaskResult {
    ctx.set_method("inspect");
    stats.lock()[index].inspections += 1;
    ctx.wait_sim_time(params.inspection_time, 1).await?;
    Ok(())
}

async fn inspector(
    ctx: TaskContext,
    machines: Vec<TaskHandle>,
    interval: Tick,
    mut rng: DelayRng,
) -> TaskResult {
    ctx.set_method("patrol");
    loop {
        let target = machines[rng.uniform_ticks(0, machines.len() as Tick) as usize];
        match ctx.scheduler().interrupt(target) {
            Ok(()) => debug!(machine = %target, tick = ctx.now(), "inspection started"),
            // already being inspected, or mid-step
            Err(SchedulerError::NotWaiting(_)) => {}
            Err(e) => return Err(e.into()),
        }
        ctx.wait_for(interval.max(1), 0).await?;
    }
}

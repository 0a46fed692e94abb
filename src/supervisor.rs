//! Supervisor that runs scheduled events concurrently under one context
//!
//! Every [`ScheduledTask`] becomes its own tokio task: it resolves its
//! trigger from the first snapshot, polls it, and runs its behavior once when
//! it fires. Tasks share nothing but the [`CoordinationContext`]; a fault or
//! panic in one task is logged and reported without touching the others.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::coordination::{CoordinationContext, OutboundQueues, checkpoint};
use crate::events::{EventBehavior, EventRun, SequenceOutcome};
use crate::telemetry::TelemetryView;
use crate::trigger::{TriggerDecision, TriggerScheduler, TriggerSpec};
use crate::{RaceControlError, Result};

/// Default interval between trigger polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive telemetry failures tolerated while waiting for a trigger
const MAX_TELEMETRY_ERRORS: u32 = 10;

/// One configured event: a trigger paired with a behavior
pub struct ScheduledTask {
    pub name: String,
    pub trigger: TriggerSpec,
    pub behavior: Box<dyn EventBehavior>,
}

impl ScheduledTask {
    pub fn new(
        name: impl Into<String>,
        trigger: TriggerSpec,
        behavior: impl EventBehavior + 'static,
    ) -> Self {
        Self { name: name.into(), trigger, behavior: Box::new(behavior) }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("behavior", &self.behavior.kind())
            .finish()
    }
}

/// How one task ended
#[derive(Debug)]
pub struct TaskReport {
    pub name: String,
    pub result: Result<SequenceOutcome>,
}

/// Running supervisor
pub struct SupervisorHandle {
    context: Arc<CoordinationContext>,
    queues: Option<OutboundQueues>,
    tasks: JoinSet<TaskReport>,
}

impl SupervisorHandle {
    /// Shared context of this run
    pub fn context(&self) -> Arc<CoordinationContext> {
        Arc::clone(&self.context)
    }

    /// Receivers for the outbound queues; available once
    pub fn take_queues(&mut self) -> Option<OutboundQueues> {
        self.queues.take()
    }

    /// Number of tasks still running
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every task and wait for them to finish
    pub async fn stop(self) -> Vec<TaskReport> {
        self.context.cancel();
        self.join().await
    }

    /// Wait for every task to finish on its own
    pub async fn join(mut self) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("Supervised task did not complete: {}", e);
                    reports.push(TaskReport {
                        name: "unknown".to_string(),
                        result: Err(RaceControlError::task_failed("unknown", e.to_string())),
                    });
                }
            }
        }
        info!(tasks = reports.len(), "Supervisor stopped");
        reports
    }
}

/// Starts scheduled events
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use racecontrol::events::{CautionConfig, CautionSequence};
/// use racecontrol::providers::ReplayTelemetry;
/// use racecontrol::supervisor::{EventSupervisor, ScheduledTask};
/// use racecontrol::trigger::TriggerSpec;
///
/// # async fn run() -> racecontrol::Result<()> {
/// let view = Arc::new(ReplayTelemetry::open("session.yaml")?);
/// let caution = CautionSequence::new(CautionConfig::default());
/// let trigger = TriggerSpec::time(50, 600.0, -600.0);
/// let tasks = vec![ScheduledTask::new("random caution", trigger, caution)];
///
/// let handle = EventSupervisor::new().spawn(view, tasks);
/// for report in handle.join().await {
///     println!("{}: {:?}", report.name, report.result);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EventSupervisor {
    poll_interval: Duration,
    seed: Option<u64>,
}

impl Default for EventSupervisor {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, seed: None }
    }
}

impl EventSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval between trigger polls
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Seed trigger draws for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Spawn one task per scheduled event. Must be called inside a tokio runtime.
    pub fn spawn(
        &self,
        view: Arc<dyn TelemetryView>,
        tasks: Vec<ScheduledTask>,
    ) -> SupervisorHandle {
        let (context, queues) = CoordinationContext::new();
        let mut set = JoinSet::new();

        info!(tasks = tasks.len(), poll_interval = ?self.poll_interval, "Supervisor starting");
        for (index, task) in tasks.into_iter().enumerate() {
            let rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                None => StdRng::from_os_rng(),
            };
            let ctx = Arc::clone(&context);
            let view = Arc::clone(&view);
            let poll = self.poll_interval;
            set.spawn(supervise(task, view, ctx, poll, rng));
        }

        SupervisorHandle { context, queues: Some(queues), tasks: set }
    }
}

/// Task boundary: faults and panics end here
async fn supervise(
    mut task: ScheduledTask,
    view: Arc<dyn TelemetryView>,
    ctx: Arc<CoordinationContext>,
    poll: Duration,
    mut rng: StdRng,
) -> TaskReport {
    let name = task.name.clone();
    let kind = task.behavior.kind();
    let run = EventRun::new(name.clone(), Arc::clone(&ctx), view);

    let driven = AssertUnwindSafe(drive(&mut task, &run, poll, &mut rng)).catch_unwind().await;
    let result = match driven {
        Ok(result) => result,
        Err(panic) => {
            let details = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(RaceControlError::task_failed(&name, format!("panicked: {}", details)))
        }
    };

    match &result {
        Ok(outcome) => info!(event = %name, kind, ?outcome, "Event finished"),
        Err(e) => {
            error!(event = %name, kind, error = ?e, "Event failed: {}", e);
            if ctx.busy_holder().as_deref() == Some(name.as_str()) {
                warn!(
                    event = %name,
                    "Busy flag left set by failed event; \
                     further cautions stay blocked until force_clear_busy"
                );
            }
        }
    }
    TaskReport { name, result }
}

/// Resolve the trigger, wait for it, then run the behavior once
async fn drive(
    task: &mut ScheduledTask,
    run: &EventRun,
    poll: Duration,
    rng: &mut StdRng,
) -> Result<SequenceOutcome> {
    let mut scheduler: Option<TriggerScheduler> = None;
    let mut error_count = 0u32;
    loop {
        match run.snapshot().await {
            Ok(snapshot) => {
                error_count = 0;
                let scheduler = match &mut scheduler {
                    Some(scheduler) => scheduler,
                    None => {
                        let resolved = TriggerScheduler::new(&task.trigger, &snapshot, rng)?;
                        info!(
                            event = %run.name,
                            kind = task.behavior.kind(),
                            start_threshold = resolved.start_threshold(),
                            "Event scheduled"
                        );
                        scheduler.insert(resolved)
                    }
                };
                match scheduler.poll(&snapshot, run.ctx.is_busy(), rng) {
                    TriggerDecision::Waiting => {}
                    TriggerDecision::Skipped => {
                        return Ok(SequenceOutcome::Skipped("likelihood roll failed".to_string()));
                    }
                    TriggerDecision::Fire => {
                        let run = run.clone().with_quickie(scheduler.quickie());
                        info!(event = %run.name, quickie = run.quickie, "Event firing");
                        return task.behavior.run_sequence(&run).await;
                    }
                }
            }
            Err(e) if e.is_retryable() && error_count + 1 < MAX_TELEMETRY_ERRORS => {
                error_count += 1;
                warn!(
                    event = %run.name,
                    "Telemetry error ({}/{}): {}",
                    error_count,
                    MAX_TELEMETRY_ERRORS,
                    e
                );
                let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                checkpoint!(run.sleep(backoff).await);
                continue;
            }
            Err(e) => return Err(e),
        }
        debug!(event = %run.name, "Trigger waiting");
        checkpoint!(run.sleep(poll).await);
    }
}

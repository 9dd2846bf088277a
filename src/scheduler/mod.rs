//! Scheduler: priority queue, admission, execution, cancellation, warm-up,
//! and violation dispatch (C6, spec §4.6).

pub mod queue;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::budget::{AdaptiveProfile, BudgetEngine, Constraint, MeasuredBaseline, SamplerReadings, Violation};
use crate::error::CoreError;
use crate::handle::Modality;
use crate::scheduler::queue::{Priority, PriorityQueue, TaskPayload};
use crate::telemetry::battery::{BatterySampler, SAMPLE_PERIOD as BATTERY_SAMPLE_PERIOD};
use crate::telemetry::resource::ResourceSampler;
use crate::telemetry::thermal::ThermalSampler;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

const WARM_UP_SAMPLE_COUNT: usize = 20;
const THERMAL_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Terminal result of a `ScheduledTask`, delivered to the submitter through
/// its oneshot receiver. `Completed`/`Failed` carry whatever the payload
/// future produced; the Scheduler never inspects the boxed value itself.
pub enum TaskOutcome {
    Completed(Box<dyn Any + Send>),
    Failed(CoreError),
    Cancelled,
}

type ViolationListener = Box<dyn Fn(&Violation) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, ViolationListener)>,
}

struct SchedulerInner {
    queue: Mutex<PriorityQueue>,
    notify: Notify,
    percentile: Mutex<crate::telemetry::PercentileTracker>,
    budget: Mutex<BudgetEngine>,
    listeners: Mutex<Listeners>,
    pending_violations: Mutex<Vec<Violation>>,
    warmed_up: AtomicBool,
    thermal: Arc<ThermalSampler>,
    battery: Arc<BatterySampler>,
    resource: Mutex<ResourceSampler>,
    telemetry: TelemetryBus,
}

/// Hub of the runtime supervision core. Owns the priority queue and drives
/// one cooperative task that dequeues, runs, and completes tasks to
/// completion before dequeuing the next (spec §4.6's single-driver-task
/// model). Samplers start when the Scheduler is constructed and stop when
/// it is dropped (spec §3 lifecycle note).
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    shutdown: Arc<AtomicBool>,
    driver_handle: Option<JoinHandle<()>>,
    battery_handle: Option<JoinHandle<()>>,
    thermal_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(thermal: Arc<ThermalSampler>, battery: Arc<BatterySampler>, resource: ResourceSampler) -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(PriorityQueue::new()),
            notify: Notify::new(),
            percentile: Mutex::new(crate::telemetry::PercentileTracker::new()),
            budget: Mutex::new(BudgetEngine::new()),
            listeners: Mutex::new(Listeners { next_id: 1, entries: Vec::new() }),
            pending_violations: Mutex::new(Vec::new()),
            warmed_up: AtomicBool::new(false),
            thermal,
            battery,
            resource: Mutex::new(resource),
            telemetry: TelemetryBus::new(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let driver_inner = inner.clone();
        let driver_shutdown = shutdown.clone();
        let driver_handle = tokio::spawn(async move { driver_loop(driver_inner, driver_shutdown).await });

        let battery_inner = inner.clone();
        let battery_shutdown = shutdown.clone();
        let battery_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(BATTERY_SAMPLE_PERIOD);
            loop {
                interval.tick().await;
                if battery_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                battery_inner.battery.sample();
            }
        });

        let thermal_inner = inner.clone();
        let thermal_shutdown = shutdown.clone();
        let thermal_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(THERMAL_POLL_PERIOD);
            loop {
                interval.tick().await;
                if thermal_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                thermal_inner.thermal.poll();
            }
        });

        Self {
            inner,
            shutdown,
            driver_handle: Some(driver_handle),
            battery_handle: Some(battery_handle),
            thermal_handle: Some(thermal_handle),
        }
    }

    pub fn subscribe_telemetry(&self) -> tokio::sync::broadcast::Receiver<TelemetryEvent> {
        self.inner.telemetry.subscribe()
    }

    pub fn set_budget(&self, budget: crate::budget::Budget) {
        self.inner.budget.lock().unwrap().set(budget);
    }

    pub fn get_budget(&self) -> crate::budget::Budget {
        self.inner.budget.lock().unwrap().get()
    }

    pub fn on_violation(&self, cb: impl Fn(&Violation) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Box::new(cb)));
        id
    }

    pub fn remove_violation_listener(&self, id: ListenerId) {
        self.inner.listeners.lock().unwrap().entries.retain(|(lid, _)| *lid != id);
    }

    /// Submits a task, returning a receiver that resolves once the task is
    /// dispatched and run (or cancelled while still queued).
    pub fn submit(
        &self,
        priority: Priority,
        workload_tag: Modality,
        payload: TaskPayload,
    ) -> (Uuid, oneshot::Receiver<TaskOutcome>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push(id, priority, workload_tag, None, payload, tx);
        }
        self.inner.notify.notify_one();
        (id, rx)
    }

    /// Cancels a task if it is still `Queued`. Returns `false` if it has
    /// already been dispatched (or never existed) — only queued tasks may
    /// be cancelled (spec §4.6).
    pub fn cancel(&self, id: Uuid) -> bool {
        self.inner.queue.lock().unwrap().cancel(id)
    }

    pub fn percentile_snapshot(&self) -> (f64, f64, f64) {
        let mut tracker = self.inner.percentile.lock().unwrap();
        (tracker.p50(), tracker.p95(), tracker.p99())
    }

    pub fn is_warmed_up(&self) -> bool {
        self.inner.warmed_up.load(Ordering::Relaxed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        // Background tasks hold their own `Arc<SchedulerInner>` clone and
        // exit on their own once they observe `shutdown`; we do not join
        // them here since `Drop` must not block.
        if let Some(h) = self.driver_handle.take() {
            h.abort();
        }
        if let Some(h) = self.battery_handle.take() {
            h.abort();
        }
        if let Some(h) = self.thermal_handle.take() {
            h.abort();
        }
    }
}

fn gather_readings(inner: &SchedulerInner) -> SamplerReadings {
    let p95_ms = Some(inner.percentile.lock().unwrap().p95());
    let drain_per_600s = inner.battery.current_drain_rate();
    let thermal_level = Some(inner.thermal.current_level() as i8);
    let rss_mb = inner.resource.lock().unwrap().current_rss_mb();
    SamplerReadings { p95_ms, drain_per_600s, thermal_level, rss_mb }
}

/// Budget evaluation before dispatch, per spec §4.6: records new
/// violations, invokes listeners in registration order, and marks any
/// previously-reported violation as mitigated once its constraint is no
/// longer exceeded.
fn reevaluate_and_dispatch(inner: &SchedulerInner) {
    let readings = gather_readings(inner);
    let fresh = inner.budget.lock().unwrap().evaluate(readings);
    let fresh_constraints: Vec<Constraint> = fresh.iter().map(|v| v.constraint).collect();

    let mut pending = inner.pending_violations.lock().unwrap();
    let mut still_pending = Vec::new();
    for mut v in pending.drain(..) {
        if !fresh_constraints.contains(&v.constraint) {
            v.mitigated = true;
            dispatch_violation(inner, &v);
        } else {
            still_pending.push(v);
        }
    }
    *pending = still_pending;

    for v in fresh {
        if !pending.iter().any(|p| p.constraint == v.constraint) {
            dispatch_violation(inner, &v);
            pending.push(v);
        }
    }
}

fn dispatch_violation(inner: &SchedulerInner, violation: &Violation) {
    inner.telemetry.publish(TelemetryEvent::Violation(violation.clone()));
    let listeners = inner.listeners.lock().unwrap();
    for (_, cb) in listeners.entries.iter() {
        cb(violation);
    }
}

fn maybe_warm_up(inner: &SchedulerInner) {
    if inner.warmed_up.load(Ordering::Relaxed) {
        return;
    }
    let profile = match inner.budget.lock().unwrap().get().adaptive_profile {
        Some(p) => p,
        None => return,
    };
    let sample_count = inner.percentile.lock().unwrap().len();
    if sample_count < WARM_UP_SAMPLE_COUNT {
        return;
    }
    let baseline = MeasuredBaseline {
        p95_ms: inner.percentile.lock().unwrap().p95(),
        drain_per_600s: inner.battery.current_drain_rate(),
        thermal_level: inner.thermal.current_level() as i8,
        rss_mb: inner.resource.lock().unwrap().current_rss_mb().unwrap_or(0.0),
        sample_count,
        at: Instant::now(),
    };
    let resolved = resolve_profile(profile, &baseline);
    inner.budget.lock().unwrap().set(resolved);
    inner.warmed_up.store(true, Ordering::Relaxed);
    debug!(sample_count, "warm-up complete, budget resolved from measured baseline");
}

fn resolve_profile(profile: AdaptiveProfile, baseline: &MeasuredBaseline) -> crate::budget::Budget {
    BudgetEngine::resolve(profile, baseline)
}

#[instrument(skip(inner, shutdown))]
async fn driver_loop(inner: Arc<SchedulerInner>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let popped = { inner.queue.lock().unwrap().pop() };
        match popped {
            Some(entry) => {
                reevaluate_and_dispatch(&inner);
                let start = Instant::now();
                let result = entry.payload.await;
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                inner.percentile.lock().unwrap().record(elapsed_ms);
                maybe_warm_up(&inner);
                let outcome = match result {
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(e) => TaskOutcome::Failed(e),
                };
                let _ = entry.outcome_tx.send(outcome);
            }
            None => {
                inner.notify.notified().await;
            }
        }
    }
}

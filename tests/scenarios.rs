//! Black-box runs of the six end-to-end scenarios this crate's behavior is
//! specified against, driven entirely through `runtime_supervision_core`'s
//! public API (`Scheduler`, the samplers, `FrameQueue`, and
//! `RuntimeSupervisionCore` for the one scenario that needs a live Worker).
//!
//! Requires the `test-support` feature, which exposes the in-memory
//! `FakeBackend` outside `cfg(test)` so this integration binary — linked
//! against the crate without `cfg(test)` — can build a Worker without a
//! real model-runtime shared library.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runtime_supervision_core::budget::{AdaptiveProfile, Budget};
use runtime_supervision_core::scheduler::queue::TaskPayload;
use runtime_supervision_core::telemetry::battery::{BatterySampler, UnavailableSource as UnavailableBattery};
use runtime_supervision_core::telemetry::resource::{ResourceSampler, UnavailableSource as UnavailableRss};
use runtime_supervision_core::telemetry::thermal::{ThermalSampler, ThermalSource};
use runtime_supervision_core::workers::frame_queue::{Frame, FrameQueue};
use runtime_supervision_core::workers::runtime::tests::FakeBackend;
use runtime_supervision_core::workers::runtime::BackendRuntime;
use runtime_supervision_core::{Modality, Priority, RuntimeConfig, RuntimeSupervisionCore, Scheduler, TaskOutcome};

/// Raw thermal readings handed out one at a time, in order, then `None`
/// forever — lets a test script an exact level transition.
struct ScriptedThermalSource {
    levels: Mutex<Vec<i8>>,
}

impl ThermalSource for ScriptedThermalSource {
    fn read(&self) -> Option<i8> {
        let mut levels = self.levels.lock().unwrap();
        if levels.is_empty() {
            None
        } else {
            Some(levels.remove(0))
        }
    }
}

struct FixedRss(f64);

impl runtime_supervision_core::telemetry::resource::RssSource for FixedRss {
    fn read_rss_mb(&self) -> Option<f64> {
        Some(self.0)
    }
}

fn no_thermal_scheduler() -> Scheduler {
    let thermal = Arc::new(ThermalSampler::new(Arc::new(
        runtime_supervision_core::telemetry::thermal::UnavailableSource,
    )));
    let battery = Arc::new(BatterySampler::new(Box::new(UnavailableBattery)));
    let resource = ResourceSampler::new(Box::new(UnavailableRss));
    Scheduler::new(thermal, battery, resource)
}

fn sleeping_payload(delay_ms: u64) -> TaskPayload {
    Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(Box::new(()) as Box<dyn Any + Send>)
    })
}

/// Scenario: warm-up resolves a Balanced adaptive budget after 20 samples.
/// The driver records real wall-clock latency for each task, and
/// `quantile(0.95)` over 20 samples is `floor(20·0.95) = 19`, i.e. the
/// largest observed sample (§4.1) — not a nearest-rank estimate — so the
/// resolved `p95_ms` tracks whatever the slowest of the ~100..119ms sleeps
/// actually measured, scaled by Balanced's 1.5x multiplier. That measured
/// value is timer-jitter-sensitive, so this only bounds it rather than
/// asserting an exact figure; no violations should be raised along the way
/// (there is nothing to violate yet — the budget is unresolved until
/// warm-up completes).
#[tokio::test]
async fn warm_up_resolves_balanced_budget_from_measured_baseline() {
    let scheduler = no_thermal_scheduler();
    scheduler.set_budget(Budget { adaptive_profile: Some(AdaptiveProfile::Balanced), ..Default::default() });

    let violations = Arc::new(Mutex::new(Vec::new()));
    let violations_clone = violations.clone();
    let _listener = scheduler.on_violation(move |v| violations_clone.lock().unwrap().push(v.clone()));

    let mut receivers = Vec::new();
    for i in 0..20u64 {
        let (_, rx) = scheduler.submit(Priority::Normal, Modality::Text, sleeping_payload(100 + i));
        receivers.push(rx);
    }
    for rx in receivers {
        let _ = rx.await;
    }

    assert!(scheduler.is_warmed_up());
    let budget = scheduler.get_budget();
    let p95 = budget.p95_ms.expect("adaptive budget should resolve p95_ms after warm-up");
    // The slowest sleep requested was ~119ms, so the max-sample p95 scaled
    // by 1.5 should land comfortably above 150ms; an upper bound well past
    // any plausible scheduling jitter guards against a regression to a
    // wildly wrong baseline without hard-coding a single exact value.
    assert!((150.0..300.0).contains(&p95), "expected p95_ms in [150, 300), got {p95}");
    assert_eq!(budget.memory_ceiling_mb, None);
    assert!(violations.lock().unwrap().is_empty());
}

/// Scenario: five Normal-priority tasks submitted back to back run in
/// strict submission order.
#[tokio::test]
async fn fifo_ordering_within_a_priority_band() {
    let scheduler = no_thermal_scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut receivers = Vec::new();
    for tag in 0..5u8 {
        let order = order.clone();
        let payload: TaskPayload = Box::pin(async move {
            order.lock().unwrap().push(tag);
            Ok(Box::new(tag) as Box<dyn Any + Send>)
        });
        let (_, rx) = scheduler.submit(Priority::Normal, Modality::Text, payload);
        receivers.push(rx);
    }
    for rx in receivers {
        let _ = rx.await;
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

/// Scenario: a High-priority task submitted while a Low-priority task is
/// already running must wait for it — the driver never preempts a task
/// mid-flight, only chooses what to dispatch next.
#[tokio::test]
async fn preemption_boundary_never_interrupts_a_running_task() {
    let scheduler = no_thermal_scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));

    let low_order = order.clone();
    let (_, low_rx) = scheduler.submit(
        Priority::Low,
        Modality::Text,
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            low_order.lock().unwrap().push("low");
            Ok(Box::new(()) as Box<dyn Any + Send>)
        }),
    );
    tokio::time::sleep(Duration::from_millis(15)).await;

    let high_order = order.clone();
    let (_, high_rx) = scheduler.submit(
        Priority::High,
        Modality::Text,
        Box::pin(async move {
            high_order.lock().unwrap().push("high");
            Ok(Box::new(()) as Box<dyn Any + Send>)
        }),
    );

    let _ = low_rx.await;
    let _ = high_rx.await;
    assert_eq!(*order.lock().unwrap(), vec!["low", "high"]);
}

/// Scenario: ten frames enqueued while only one consumer slot exists drop
/// nine and keep the tenth — drop-newest backpressure, not a growing queue.
#[test]
fn backpressure_drops_nine_frames_keeps_the_tenth() {
    let mut queue = FrameQueue::new();
    queue.enqueue(Frame { rgb_bytes: vec![0; 3], width: 1, height: 1 });
    assert!(queue.dequeue().is_some());
    for tag in 1..=10u8 {
        queue.enqueue(Frame { rgb_bytes: vec![tag; 3], width: 1, height: 1 });
    }
    assert_eq!(queue.dropped_count(), 9);
    queue.mark_done();
    let kept = queue.dequeue().unwrap();
    assert_eq!(kept.rgb_bytes, vec![10u8; 3]);
}

/// Scenario: cancelling a `StreamSession` mid-generation stops delivery
/// within a bounded number of further pieces — the cooperative cancel flag
/// is checked between tokens, not preemptively mid-sample.
#[tokio::test]
async fn cancellation_during_stream_stops_delivery_promptly() {
    let backend: Arc<dyn BackendRuntime> = Arc::new(FakeBackend::default());
    let core = RuntimeSupervisionCore::new(RuntimeConfig::default(), backend).unwrap();
    let worker = core.spawn_text_worker("fake.gguf", 0).unwrap();

    let params = runtime_supervision_core::workers::GenerationParams { max_tokens: 100, ..Default::default() };
    let mut session = worker.stream("hello there", &params).await.unwrap();

    let mut pulled = 0usize;
    loop {
        match session.pull().await {
            runtime_supervision_core::workers::PullResult::Piece(_) => {
                pulled += 1;
                if pulled == 3 {
                    session.cancel();
                }
            }
            runtime_supervision_core::workers::PullResult::Ended
            | runtime_supervision_core::workers::PullResult::Cancelled => break,
        }
    }
    // the generation loop checks the cancel flag at up to two points per
    // token, so a handful of in-flight pieces may still land after cancel()
    assert!(pulled <= 6, "expected cancellation to bound delivery, got {pulled} pieces");
}

/// Scenario: a thermal transition past the budget's ceiling emits exactly
/// one non-observe-only Violation; an RSS reading past the memory ceiling
/// emits a second, observe-only Violation in the same dispatch pass.
#[tokio::test]
async fn thermal_violation_is_actionable_memory_violation_is_observe_only() {
    let thermal_source = Arc::new(ScriptedThermalSource { levels: Mutex::new(vec![0, 2]) });
    let thermal = Arc::new(ThermalSampler::new(thermal_source));
    let battery = Arc::new(BatterySampler::new(Box::new(UnavailableBattery)));
    let resource = ResourceSampler::new(Box::new(FixedRss(600.0)));
    let scheduler = Scheduler::new(thermal.clone(), battery, resource);

    scheduler.set_budget(Budget { max_thermal_level: Some(1), memory_ceiling_mb: Some(500.0), ..Default::default() });

    // consumed during ThermalSampler::new's initial read
    assert_eq!(thermal.current_level(), runtime_supervision_core::ThermalLevel::Nominal);
    thermal.poll();
    assert_eq!(thermal.current_level(), runtime_supervision_core::ThermalLevel::Serious);

    let violations = Arc::new(Mutex::new(Vec::new()));
    let violations_clone = violations.clone();
    let _listener = scheduler.on_violation(move |v| violations_clone.lock().unwrap().push(v.clone()));

    let (_, rx) = scheduler.submit(Priority::Normal, Modality::Text, sleeping_payload(1));
    let outcome = rx.await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed(_)));

    let seen = violations.lock().unwrap();
    let thermal_violation = seen
        .iter()
        .find(|v| v.constraint == runtime_supervision_core::budget::Constraint::Thermal)
        .expect("thermal violation should have been dispatched");
    assert_eq!(thermal_violation.measured, 2.0);
    assert_eq!(thermal_violation.budget, 1.0);
    assert_eq!(thermal_violation.mitigation_text, "pause high-priority");
    assert!(!thermal_violation.observe_only);

    let memory_violation = seen
        .iter()
        .find(|v| v.constraint == runtime_supervision_core::budget::Constraint::Memory)
        .expect("memory violation should have been dispatched");
    assert_eq!(memory_violation.measured, 600.0);
    assert_eq!(memory_violation.budget, 500.0);
    assert!(memory_violation.observe_only);

    let thermal_count = seen.iter().filter(|v| v.constraint == runtime_supervision_core::budget::Constraint::Thermal).count();
    assert_eq!(thermal_count, 1, "thermal violation must be dispatched exactly once while sustained");
}

/// Sanity check that the `RuntimeSupervisionCore` facade really does share
/// one backend guard across Workers (covered more directly by the crate's
/// own unit tests) — exercised here as a side effect of driving the stream
/// cancellation scenario through the public API instead of a raw Worker
/// constructor.
#[tokio::test]
async fn spawning_a_worker_through_the_core_facade_is_usable_immediately() {
    let backend: Arc<dyn BackendRuntime> = Arc::new(FakeBackend::default());
    let core = RuntimeSupervisionCore::new(RuntimeConfig::default(), backend).unwrap();
    let worker = core.spawn_text_worker("fake.gguf", 0).unwrap();
    let calls = AtomicUsize::new(0);
    let params = runtime_supervision_core::workers::GenerationParams { max_tokens: 8, ..Default::default() };
    let text = worker.generate("ping", &params).await.unwrap();
    calls.fetch_add(1, Ordering::Relaxed);
    assert!(!text.is_empty());
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

use super::*;
use crate::descriptor::SensorParams;
use crate::error::ConfigError;
use crate::queue::{EvictionPolicy, QueueConfig};
use crate::sample::SampleValue;
use async_trait::async_trait;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Clone, Copy)]
enum Step {
    Ok,
    Fail,
    Panic,
    Hang(Duration),
}

struct ScriptedSensor {
    name: String,
    calls: AtomicU64,
    script: Box<dyn Fn(u64) -> Step + Send + Sync>,
    reentrant: bool,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedSensor {
    fn new(name: &str, script: impl Fn(u64) -> Step + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicU64::new(0),
            script: Box::new(script),
            reentrant: false,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn concurrent(mut self, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        self.reentrant = true;
        self.active = active;
        self.peak = peak;
        self
    }
}

#[async_trait]
impl Sensor for ScriptedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &SensorParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn collect(&self, _deadline: Instant) -> Result<Sample, SensorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(n) {
            Step::Ok => {}
            Step::Fail => return Err(SensorError::Io("device not responding".to_string())),
            Step::Panic => panic!("driver bug"),
            Step::Hang(d) => {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(d).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(Sample::new(&self.name, SampleValue::Integer(n as i64)))
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }
}

fn configured(
    sensor: ScriptedSensor,
    interval_ms: u64,
    timeout_ms: u64,
    on_failure: FailurePolicy,
) -> ConfiguredSensor {
    with_interval(sensor, Duration::from_millis(interval_ms), timeout_ms, on_failure)
}

fn with_interval(
    sensor: ScriptedSensor,
    interval: Duration,
    timeout_ms: u64,
    on_failure: FailurePolicy,
) -> ConfiguredSensor {
    ConfiguredSensor {
        descriptor: Arc::new(SensorDescriptor {
            name: sensor.name.clone(),
            kind: "scripted".to_string(),
            interval,
            timeout: Duration::from_millis(timeout_ms),
            on_failure,
            params: SensorParams::new(),
        }),
        sensor: Arc::new(sensor),
    }
}

fn queue() -> SampleQueue {
    SampleQueue::new(QueueConfig {
        capacity: 1000,
        policy: EvictionPolicy::DropOldest,
        record_gaps: true,
    })
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent: 8,
        shutdown_grace: Duration::from_secs(1),
    }
}

fn values_for(samples: &[Sample], sensor: &str) -> Vec<i64> {
    samples
        .iter()
        .filter(|s| s.sensor == sensor)
        .map(|s| match s.value {
            SampleValue::Integer(v) => v,
            _ => unreachable!(),
        })
        .collect()
}

async fn run_for(scheduler: Scheduler, duration: Duration) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(duration).await;
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn alternating_timeouts_only_enqueue_successes() {
    let flaky = ScriptedSensor::new("flaky", |n| {
        if n % 2 == 0 {
            Step::Ok
        } else {
            Step::Hang(Duration::from_secs(2))
        }
    });
    let steady = ScriptedSensor::new("steady", |_| Step::Ok);
    let q = queue();
    let scheduler = Scheduler::new(
        vec![
            configured(flaky, 1000, 500, FailurePolicy::Skip),
            configured(steady, 1000, 500, FailurePolicy::Skip),
        ],
        q.clone(),
        config(),
    );
    let stats = scheduler.stats();

    // Ticks at t = 0..=9s; the last timeout fires at 9.5s.
    run_for(scheduler, Duration::from_millis(9_600)).await;

    let samples = q.drain_all();
    assert_eq!(values_for(&samples, "flaky"), vec![0, 2, 4, 6, 8]);
    let flaky: Vec<&Sample> = samples.iter().filter(|s| s.sensor == "flaky").collect();
    assert!(flaky
        .windows(2)
        .all(|w| w[0].monotonic_ms <= w[1].monotonic_ms && w[0].timestamp <= w[1].timestamp));

    let flaky_stats = stats.get("flaky").unwrap();
    assert_eq!(flaky_stats.successes, 5);
    assert_eq!(flaky_stats.failures, 5);
    assert_eq!(flaky_stats.timeouts, 5);
    assert!(!flaky_stats.suspended);

    // The other sensor kept its one-second cadence throughout.
    assert_eq!(values_for(&samples, "steady"), (0..10i64).collect::<Vec<_>>());
    assert_eq!(stats.get("steady").unwrap().failures, 0);
}

#[tokio::test(start_paused = true)]
async fn disable_after_suspends_sensor_and_raises_event() {
    let broken = ScriptedSensor::new("broken", |_| Step::Fail);
    let policy = FailurePolicy::DisableAfter(NonZeroU32::new(3).unwrap());
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(
        vec![configured(broken, 1000, 500, policy)],
        queue(),
        config(),
    )
    .with_events(tx);
    let stats = scheduler.stats();

    run_for(scheduler, Duration::from_secs(10)).await;

    let broken = stats.get("broken").unwrap();
    assert_eq!(broken.failures, 3);
    assert!(broken.suspended);

    let mut suspended = 0;
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::Suspended { sensor, consecutive } = event {
            assert_eq!(sensor, "broken");
            assert_eq!(consecutive, 3);
            suspended += 1;
        }
    }
    assert_eq!(suspended, 1);
}

#[tokio::test(start_paused = true)]
async fn success_resets_consecutive_failures() {
    // fail, fail, ok, fail, fail, ok ... never three in a row
    let wobbly = ScriptedSensor::new("wobbly", |n| if n % 3 == 2 { Step::Ok } else { Step::Fail });
    let policy = FailurePolicy::DisableAfter(NonZeroU32::new(3).unwrap());
    let scheduler = Scheduler::new(vec![configured(wobbly, 1000, 500, policy)], queue(), config());
    let stats = scheduler.stats();

    run_for(scheduler, Duration::from_millis(8_500)).await;

    let wobbly = stats.get("wobbly").unwrap();
    assert!(!wobbly.suspended);
    assert_eq!(wobbly.successes, 3);
    assert_eq!(wobbly.failures, 6);
}

#[tokio::test(start_paused = true)]
async fn non_reentrant_sensor_skips_overlapping_ticks() {
    let slow = ScriptedSensor::new("slow", |_| Step::Hang(Duration::from_millis(2_500)));
    let q = queue();
    let scheduler = Scheduler::new(
        vec![configured(slow, 1000, 10_000, FailurePolicy::Skip)],
        q.clone(),
        config(),
    );
    let stats = scheduler.stats();

    // Runs start at 0s and 3s; ticks at 1s, 2s, 4s, 5s are skipped.
    run_for(scheduler, Duration::from_millis(5_600)).await;

    let slow = stats.get("slow").unwrap();
    assert_eq!(slow.successes, 2);
    assert_eq!(slow.overlap_skips, 4);
    assert_eq!(slow.failures, 0);
    assert_eq!(values_for(&q.drain_all(), "slow"), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn global_limit_bounds_concurrent_collects() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let sensors = (0..4)
        .map(|i| {
            let sensor = ScriptedSensor::new(&format!("s{i}"), |_| Step::Hang(Duration::from_millis(100)))
                .concurrent(active.clone(), peak.clone());
            configured(sensor, 1000, 900, FailurePolicy::Skip)
        })
        .collect();
    let scheduler = Scheduler::new(
        sensors,
        queue(),
        SchedulerConfig {
            max_concurrent: 2,
            shutdown_grace: Duration::from_secs(1),
        },
    );
    let stats = scheduler.stats();

    run_for(scheduler, Duration::from_millis(2_500)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let total: u64 = stats.snapshot().values().map(|s| s.successes).sum();
    assert_eq!(total, 12);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_collects_after_grace() {
    let stuck = ScriptedSensor::new("stuck", |_| Step::Hang(Duration::from_secs(3_600)));
    let scheduler = Scheduler::new(
        vec![configured(stuck, 60_000, 7_200_000, FailurePolicy::Skip)],
        queue(),
        config(),
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    cancel.cancel();
    handle.await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn panicking_collect_counts_as_failure() {
    let buggy = ScriptedSensor::new("buggy", |_| Step::Panic);
    let policy = FailurePolicy::DisableAfter(NonZeroU32::new(3).unwrap());
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(
        vec![configured(buggy, 1000, 500, policy)],
        queue(),
        config(),
    )
    .with_events(tx);
    let stats = scheduler.stats();

    run_for(scheduler, Duration::from_millis(10_500)).await;

    let buggy = stats.get("buggy").unwrap();
    assert_eq!(buggy.failures, 3);
    assert_eq!(buggy.overlap_skips, 0);
    assert!(buggy.suspended);
    assert_eq!(buggy.last_error.as_deref(), Some("sensor I/O failed: collect panicked"));

    let mut suspended = false;
    while let Ok(event) = rx.try_recv() {
        suspended |= matches!(event, SchedulerEvent::Suspended { ref sensor, .. } if sensor == "buggy");
    }
    assert!(suspended);
}

#[tokio::test(start_paused = true)]
async fn unrepresentable_interval_does_not_stop_other_sensors() {
    let rare = ScriptedSensor::new("rare", |_| Step::Ok);
    let steady = ScriptedSensor::new("steady", |_| Step::Ok);
    let q = queue();
    let scheduler = Scheduler::new(
        vec![
            with_interval(rare, Duration::MAX, 500, FailurePolicy::Skip),
            configured(steady, 1000, 500, FailurePolicy::Skip),
        ],
        q.clone(),
        config(),
    );

    run_for(scheduler, Duration::from_millis(5_500)).await;

    let samples = q.drain_all();
    assert_eq!(values_for(&samples, "rare"), vec![0]);
    assert_eq!(values_for(&samples, "steady"), (0..6i64).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn reload_restarts_changed_and_suspended_sensors_only() {
    let once = FailurePolicy::DisableAfter(NonZeroU32::new(1).unwrap());
    let q = queue();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let scheduler = Scheduler::new(
        vec![
            configured(ScriptedSensor::new("a", |_| Step::Fail), 1000, 500, once),
            configured(ScriptedSensor::new("b", |_| Step::Ok), 1000, 500, FailurePolicy::Skip),
            configured(ScriptedSensor::new("d", |_| Step::Ok), 1000, 500, FailurePolicy::Skip),
        ],
        q.clone(),
        config(),
    )
    .with_reload(reload_rx);
    let stats = scheduler.stats();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(stats.get("a").unwrap().suspended);

    // Same descriptors for a and b; b's replacement would fail if it were used.
    reload_tx
        .send(vec![
            configured(ScriptedSensor::new("a", |_| Step::Ok), 1000, 500, once),
            configured(ScriptedSensor::new("b", |_| Step::Fail), 1000, 500, FailurePolicy::Skip),
            configured(ScriptedSensor::new("c", |_| Step::Ok), 1000, 500, FailurePolicy::Skip),
        ])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    cancel.cancel();
    handle.await.unwrap();

    let a = stats.get("a").unwrap();
    assert!(!a.suspended);
    assert_eq!((a.successes, a.failures), (3, 0));
    let b = stats.get("b").unwrap();
    assert_eq!((b.successes, b.failures), (4, 0));
    assert_eq!(stats.get("c").unwrap().successes, 3);
    assert!(stats.get("d").is_none());

    let samples = q.drain_all();
    assert_eq!(values_for(&samples, "a"), vec![0, 1, 2]);
    assert_eq!(values_for(&samples, "b"), vec![0, 1, 2, 3]);
    assert_eq!(values_for(&samples, "d"), vec![0, 1]);
}

#[test]
fn next_tick_stays_on_grid() {
    let base = Instant::now();
    let interval = Duration::from_secs(1);
    assert_eq!(next_tick(base, interval, base), Some(base + interval));
    assert_eq!(
        next_tick(base, interval, base + Duration::from_millis(3_400)),
        Some(base + Duration::from_secs(4))
    );
    assert_eq!(
        next_tick(base, interval, base + Duration::from_secs(3)),
        Some(base + Duration::from_secs(3))
    );
    assert_eq!(next_tick(base, Duration::MAX, base), None);
}

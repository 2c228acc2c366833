//! Adaptive concurrency prober.
//!
//! Five phases, in order: warm the stack and discard the data; double the
//! level until the SLO breaks or the ceiling is reached; bisect the
//! last-good/first-bad window down to a configured tolerance; hold the
//! boundary for a longer stability window; derive the reported numbers.
//! An SLO failure is data: the prober records it and moves on; it never
//! raises because of one.
//!
//! The search runs the [`SteadyStateEngine`] once per level and resets the
//! queue telemetry in between, so every level starts with clean counters.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use typed_builder::TypedBuilder;

use crate::aggregate::{ConcurrencyTestResult, evaluate_level};
use crate::client::Outcome;
use crate::engine::SteadyStateEngine;
use crate::queue::QueueTelemetry;
use crate::slo::Slo;

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct ProbeSettings {
    #[builder(default = 4)]
    pub warmup_concurrency: usize,
    #[builder(default = Duration::from_secs(5))]
    pub warmup_duration: Duration,
    /// First level of the exponential phase.
    #[builder(default = 20)]
    pub initial_concurrency: usize,
    /// Hard ceiling of the search.
    #[builder(default = 1_024)]
    pub max_concurrency: usize,
    /// Wall clock held at each searched level.
    #[builder(default = Duration::from_secs(10))]
    pub test_duration: Duration,
    /// Wall clock of the stability verification, typically 3x the test
    /// window.
    #[builder(default = Duration::from_secs(30))]
    pub stability_duration: Duration,
    /// Bisection stops once `first_bad - last_good` is within this many
    /// units; precision traded for wall clock.
    #[builder(default = 10)]
    pub bisect_tolerance: usize,
    /// Fraction of effective concurrency reported as the recommended
    /// operating ceiling.
    #[builder(default = 0.8)]
    pub safety_factor: f64,
}

/// What a full probe run found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Every level tested, in execution order, warmup excluded.
    pub levels: Vec<ConcurrencyTestResult>,
    /// Boundary confirmed by stability verification (derated on a failed
    /// verification).
    pub max_concurrency: usize,
    /// Highest level whose recorded result passed the SLO, any phase.
    pub effective_concurrency: usize,
    /// Throughput observed at the effective level.
    pub saturated_throughput: f64,
    /// `⌊safety_factor x effective⌋`.
    pub recommended_ceiling: usize,
    /// The very first level already violated the SLO; nothing to search.
    pub first_level_failed: bool,
    /// An external cancellation cut the probe short; `levels` holds what
    /// finished.
    pub cancelled: bool,
}

/// Closed-loop search for the highest SLO-compliant concurrency.
pub struct ConcurrencyProber<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    engine: SteadyStateEngine<F, Fut>,
    telemetry: Arc<dyn QueueTelemetry>,
    slo: Slo,
    settings: ProbeSettings,
}

impl<F, Fut> ConcurrencyProber<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    pub fn new(
        engine: SteadyStateEngine<F, Fut>,
        telemetry: Arc<dyn QueueTelemetry>,
        slo: Slo,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            engine,
            telemetry,
            slo,
            settings,
        }
    }

    /// Run the five-phase search. Cancellation at any point yields a partial
    /// result with whatever levels completed.
    pub async fn probe(&self, cancel: watch::Receiver<bool>) -> ProbeResult {
        let s = self.settings;
        let mut levels = Vec::new();

        tracing::info!(
            concurrency = s.warmup_concurrency,
            seconds = s.warmup_duration.as_secs(),
            "warming up"
        );
        let _ = self
            .engine
            .run_level(s.warmup_concurrency, s.warmup_duration, cancel.clone())
            .await;
        self.telemetry.reset();
        if *cancel.borrow() {
            return self.finish(levels, 0, true);
        }

        tracing::info!(initial = s.initial_concurrency, "growth phase");
        let mut last_good = 0usize;
        let mut first_bad = None;
        let mut k = s.initial_concurrency.max(1);
        loop {
            let result = self.run_one(k, s.test_duration, &cancel, &mut levels).await;
            if *cancel.borrow() {
                return self.finish(levels, last_good, true);
            }
            if result.verdict.passed {
                last_good = k;
                if k >= s.max_concurrency {
                    break;
                }
                k = (k * 2).min(s.max_concurrency);
            } else {
                first_bad = Some(k);
                break;
            }
        }

        if last_good == 0 {
            tracing::warn!(
                concurrency = s.initial_concurrency,
                "first level already violates the SLO"
            );
            return ProbeResult {
                levels,
                first_level_failed: true,
                ..ProbeResult::default()
            };
        }

        if let Some(bad) = first_bad {
            let (mut low, mut high) = (last_good, bad);
            tracing::info!(low, high, "bisecting");
            while high - low > s.bisect_tolerance {
                let mid = (low + high) / 2;
                let result = self
                    .run_one(mid, s.test_duration, &cancel, &mut levels)
                    .await;
                if *cancel.borrow() {
                    return self.finish(levels, last_good, true);
                }
                (low, high) = bisect_step(low, high, mid, result.verdict.passed);
                last_good = last_good.max(low);
            }
        }

        tracing::info!(
            concurrency = last_good,
            seconds = s.stability_duration.as_secs(),
            "verifying stability"
        );
        let stable = self
            .run_one(last_good, s.stability_duration, &cancel, &mut levels)
            .await;
        if *cancel.borrow() {
            return self.finish(levels, last_good, true);
        }
        let max_concurrency = if stable.verdict.passed {
            last_good
        } else {
            derate(last_good)
        };

        self.finish(levels, max_concurrency, false)
    }

    /// Run an operator-supplied schedule of levels through the same scoring
    /// path, with no search.
    pub async fn run_schedule(
        &self,
        schedule: &[usize],
        cancel: watch::Receiver<bool>,
    ) -> ProbeResult {
        let mut levels = Vec::new();
        let mut cancelled = false;
        for &k in schedule {
            let _ = self
                .run_one(k.max(1), self.settings.test_duration, &cancel, &mut levels)
                .await;
            if *cancel.borrow() {
                cancelled = true;
                break;
            }
        }
        let best = levels
            .iter()
            .filter(|l| l.verdict.passed)
            .map(|l| l.concurrency)
            .max()
            .unwrap_or(0);
        self.finish(levels, best, cancelled)
    }

    async fn run_one(
        &self,
        concurrency: usize,
        duration: Duration,
        cancel: &watch::Receiver<bool>,
        levels: &mut Vec<ConcurrencyTestResult>,
    ) -> ConcurrencyTestResult {
        self.telemetry.reset();
        let run = self
            .engine
            .run_level(concurrency, duration, cancel.clone())
            .await;
        let result = evaluate_level(
            concurrency,
            run.elapsed,
            &run.outcomes,
            self.telemetry.snapshot(),
            &self.slo,
        );
        tracing::info!(
            concurrency,
            requests = result.total_requests,
            success_rate = result.success_rate,
            p99_ms = result.latency.p99.as_secs_f64() * 1e3,
            throughput = result.throughput,
            passed = result.verdict.passed,
            "level finished"
        );
        levels.push(result.clone());
        result
    }

    fn finish(
        &self,
        levels: Vec<ConcurrencyTestResult>,
        max_concurrency: usize,
        cancelled: bool,
    ) -> ProbeResult {
        let (effective, throughput) = effective_level(&levels);
        ProbeResult {
            levels,
            max_concurrency,
            effective_concurrency: effective,
            saturated_throughput: throughput,
            recommended_ceiling: recommended(effective, self.settings.safety_factor),
            first_level_failed: false,
            cancelled,
        }
    }
}

/// Advance the bisection window from the verdict at `mid`.
fn bisect_step(low: usize, high: usize, mid: usize, passed: bool) -> (usize, usize) {
    if passed { (mid, high) } else { (low, mid) }
}

/// Reported ceiling after a failed stability verification: 10% off the
/// boundary the search converged on.
fn derate(boundary: usize) -> usize {
    boundary * 9 / 10
}

fn recommended(effective: usize, safety_factor: f64) -> usize {
    (effective as f64 * safety_factor).floor() as usize
}

/// Highest SLO-passing level across all phases, with its throughput. The
/// latest result wins when a level was tested more than once.
fn effective_level(levels: &[ConcurrencyTestResult]) -> (usize, f64) {
    let effective = levels
        .iter()
        .filter(|l| l.verdict.passed)
        .map(|l| l.concurrency)
        .max()
        .unwrap_or(0);
    let throughput = levels
        .iter()
        .rev()
        .find(|l| l.verdict.passed && l.concurrency == effective)
        .map(|l| l.throughput)
        .unwrap_or(0.0);
    (effective, throughput)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NoTelemetry, ResourceSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn bisection_narrows_the_window_monotonically() {
        // last_good=80, first_bad=160: mid 120 passes, next mid is 140
        let (low, high) = bisect_step(80, 160, 120, true);
        assert_eq!((low, high), (120, 160));
        assert_eq!((low + high) / 2, 140);

        // mid 120 fails instead: next mid is 100
        let (low, high) = bisect_step(80, 160, 120, false);
        assert_eq!((low, high), (80, 120));
        assert_eq!((low + high) / 2, 100);
    }

    #[test]
    fn bisection_lower_bound_never_decreases() {
        let (mut low, mut high) = (80usize, 160usize);
        let verdicts = [true, false, true, false];
        let mut i = 0;
        while high - low > 10 {
            let mid = (low + high) / 2;
            let prev_low = low;
            (low, high) = bisect_step(low, high, mid, verdicts[i % verdicts.len()]);
            assert!(low >= prev_low);
            i += 1;
        }
        assert!(high - low <= 10);
    }

    #[test]
    fn failed_stability_derates_by_ten_percent() {
        assert_eq!(derate(130), 117);
        assert_eq!(derate(10), 9);
        assert_eq!(derate(0), 0);
    }

    #[test]
    fn recommended_ceiling_applies_the_safety_factor() {
        assert_eq!(recommended(100, 0.8), 80);
        assert_eq!(recommended(16, 0.8), 12);
        assert_eq!(recommended(0, 0.8), 0);
    }

    fn passing(concurrency: usize, throughput: f64) -> ConcurrencyTestResult {
        let mut r = evaluate_level(
            concurrency,
            Duration::from_secs(1),
            &[],
            ResourceSnapshot::default(),
            &Slo::builder().build(),
        );
        r.verdict.passed = true;
        r.throughput = throughput;
        r
    }

    fn failing(concurrency: usize) -> ConcurrencyTestResult {
        let mut r = passing(concurrency, 0.0);
        r.verdict.passed = false;
        r
    }

    #[test]
    fn effective_level_takes_the_highest_pass_latest_result() {
        let levels = vec![
            passing(20, 100.0),
            passing(40, 180.0),
            failing(80),
            passing(40, 190.0), // stability re-test of 40
        ];
        let (effective, throughput) = effective_level(&levels);
        assert_eq!(effective, 40);
        assert!((throughput - 190.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_passing_level_means_zero_everywhere() {
        let (effective, throughput) = effective_level(&[failing(20)]);
        assert_eq!(effective, 0);
        assert_eq!(throughput, 0.0);
    }

    // -- full searches against a synthetic action -------------------------

    fn quick_settings() -> ProbeSettings {
        ProbeSettings::builder()
            .warmup_concurrency(2)
            .warmup_duration(Duration::from_millis(50))
            .initial_concurrency(8)
            .max_concurrency(256)
            .test_duration(Duration::from_millis(150))
            .stability_duration(Duration::from_millis(300))
            .build()
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    fn ok_outcome() -> Outcome {
        Outcome::Success {
            latency: Duration::from_micros(500),
            timeline: crate::queue::Timeline {
                arrival: 1,
                enqueue: 2,
                dequeue: 3,
                complete: 4,
            },
            queue_depth_at_enqueue: 0,
        }
    }

    /// Succeeds while at most `knee` requests are in flight and times out
    /// past it, like a server whose ceiling sits exactly at `knee`.
    fn kneed_action(
        knee: usize,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Outcome> + Send>> + Send + Sync + Clone
    {
        let inflight = Arc::new(AtomicUsize::new(0));
        move || {
            let inflight = Arc::clone(&inflight);
            Box::pin(async move {
                let over = inflight.fetch_add(1, Ordering::SeqCst) >= knee;
                tokio::time::sleep(Duration::from_millis(1)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                if over {
                    Outcome::Timeout {
                        layer: crate::client::TimeoutLayer::Http2ConnectionLayer,
                    }
                } else {
                    ok_outcome()
                }
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn search_converges_onto_the_knee() {
        let prober = ConcurrencyProber::new(
            SteadyStateEngine::new(kneed_action(64)),
            Arc::new(NoTelemetry),
            Slo::builder().build(),
            quick_settings(),
        );
        let result = prober.probe(no_cancel()).await;
        assert!(!result.first_level_failed);
        assert!(!result.cancelled);
        assert!(
            result.max_concurrency >= 54 && result.max_concurrency <= 74,
            "converged on {} for a knee of 64",
            result.max_concurrency
        );
        assert_eq!(
            result.recommended_ceiling,
            recommended(result.effective_concurrency, 0.8)
        );
        assert!(result.saturated_throughput > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_level_failure_short_circuits() {
        let prober = ConcurrencyProber::new(
            SteadyStateEngine::new(|| async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Outcome::Timeout {
                    layer: crate::client::TimeoutLayer::Http2ConnectionLayer,
                }
            }),
            Arc::new(NoTelemetry),
            Slo::builder().build(),
            quick_settings(),
        );
        let result = prober.probe(no_cancel()).await;
        assert!(result.first_level_failed);
        assert_eq!(result.max_concurrency, 0);
        assert_eq!(result.effective_concurrency, 0);
        assert_eq!(result.levels.len(), 1, "no bisection after a first-level fail");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_failing_skips_bisection_and_verifies_the_ceiling() {
        let prober = ConcurrencyProber::new(
            SteadyStateEngine::new(|| async {
                tokio::time::sleep(Duration::from_micros(200)).await;
                ok_outcome()
            }),
            Arc::new(NoTelemetry),
            Slo::builder().build(),
            ProbeSettings::builder()
                .warmup_concurrency(2)
                .warmup_duration(Duration::from_millis(50))
                .initial_concurrency(8)
                .max_concurrency(16)
                .test_duration(Duration::from_millis(120))
                .stability_duration(Duration::from_millis(200))
                .build(),
        );
        let result = prober.probe(no_cancel()).await;
        // growth at 8 and 16, then the stability re-test of 16
        let tested: Vec<usize> = result.levels.iter().map(|l| l.concurrency).collect();
        assert_eq!(tested, vec![8, 16, 16]);
        assert_eq!(result.max_concurrency, 16);
        assert_eq!(result.effective_concurrency, 16);
        assert_eq!(result.recommended_ceiling, 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancellation_yields_a_partial_result() {
        let (tx, rx) = watch::channel(false);
        let prober = ConcurrencyProber::new(
            SteadyStateEngine::new(|| async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                ok_outcome()
            }),
            Arc::new(NoTelemetry),
            Slo::builder().build(),
            ProbeSettings::builder()
                .warmup_concurrency(2)
                .warmup_duration(Duration::from_millis(50))
                .initial_concurrency(4)
                .max_concurrency(1_024)
                .test_duration(Duration::from_secs(5))
                .stability_duration(Duration::from_secs(15))
                .build(),
        );
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(true);
        });
        let started = std::time::Instant::now();
        let result = prober.probe(rx).await;
        assert!(result.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.levels.len() <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn schedule_mode_scores_each_requested_level() {
        let prober = ConcurrencyProber::new(
            SteadyStateEngine::new(kneed_action(32)),
            Arc::new(NoTelemetry),
            Slo::builder().build(),
            quick_settings(),
        );
        let result = prober.run_schedule(&[8, 16, 64], no_cancel()).await;
        let tested: Vec<usize> = result.levels.iter().map(|l| l.concurrency).collect();
        assert_eq!(tested, vec![8, 16, 64]);
        assert!(result.levels[0].verdict.passed);
        assert!(result.levels[1].verdict.passed);
        assert!(!result.levels[2].verdict.passed);
        assert_eq!(result.max_concurrency, 16);
    }
}

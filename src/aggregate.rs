//! Reduction of raw per-call outcomes into a per-level result.
//!
//! Raw samples are kept until the level ends and summarized once, so
//! different views (latency, queue wait, timeout layers) derive from the
//! same data without loss. Percentile selection is the fixed nearest-rank
//! rule with no interpolation, so results reproduce exactly across runs and
//! platforms.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{Outcome, TimeoutLayer};
use crate::queue::ResourceSnapshot;
use crate::slo::{Slo, SloVerdict};

/// Nearest-rank percentile over an ascending sample:
/// `s[clamp(⌈p·n/100⌉ − 1, 0, n−1)]`, and zero for an empty sample.
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let n = sorted.len();
    let rank = ((p * n as f64) / 100.0).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

/// Percentile summary of one sample set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyDistribution {
    pub min: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub stddev: Duration,
}

impl LatencyDistribution {
    pub fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let n = samples.len() as f64;
        let mean = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / n;
        let variance = samples
            .iter()
            .map(|d| (d.as_secs_f64() - mean).powi(2))
            .sum::<f64>()
            / n;
        Self {
            min: samples[0],
            p50: percentile(&samples, 50.0),
            p90: percentile(&samples, 90.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
            max: samples[samples.len() - 1],
            mean: Duration::from_secs_f64(mean),
            stddev: Duration::from_secs_f64(variance.sqrt()),
        }
    }
}

/// Everything observed while holding one concurrency level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyTestResult {
    pub concurrency: usize,
    pub duration: Duration,
    pub total_requests: u64,
    pub success_count: u64,
    pub timeout_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    /// Successful requests per second over the level's wall clock.
    pub throughput: f64,
    pub latency: LatencyDistribution,
    /// Queue residency over successful requests with complete timelines.
    pub queue_wait: LatencyDistribution,
    pub resources: ResourceSnapshot,
    pub http2_layer_timeouts: u64,
    pub server_layer_timeouts: u64,
    pub client_cancellations: u64,
    pub verdict: SloVerdict,
}

/// Reduce one level's outcomes and score them against the SLO.
///
/// Pure: the same inputs produce an identical result. Client-side
/// cancellations count into the timeout total under the client-cancelled
/// tag, so `success + timeout + error == total` always holds.
pub fn evaluate_level(
    concurrency: usize,
    duration: Duration,
    outcomes: &[Outcome],
    resources: ResourceSnapshot,
    slo: &Slo,
) -> ConcurrencyTestResult {
    let mut success_count = 0u64;
    let mut timeout_count = 0u64;
    let mut error_count = 0u64;
    let mut http2_layer = 0u64;
    let mut server_layer = 0u64;
    let mut client_cancelled = 0u64;
    let mut latencies = Vec::new();
    let mut queue_waits = Vec::new();

    for outcome in outcomes {
        match outcome {
            Outcome::Success {
                latency, timeline, ..
            } => {
                success_count += 1;
                latencies.push(*latency);
                if let Some(wait) = timeline.queue_wait() {
                    queue_waits.push(wait);
                }
            }
            Outcome::Timeout { layer } => {
                timeout_count += 1;
                match layer {
                    TimeoutLayer::Http2ConnectionLayer => http2_layer += 1,
                    TimeoutLayer::ServerQueueWait | TimeoutLayer::ServerProcessing => {
                        server_layer += 1;
                    }
                    TimeoutLayer::ClientCancelled => client_cancelled += 1,
                }
            }
            Outcome::Cancelled => {
                timeout_count += 1;
                client_cancelled += 1;
            }
            Outcome::TransportError { .. } => error_count += 1,
        }
    }

    let total = success_count + timeout_count + error_count;
    let success_rate = if total > 0 {
        success_count as f64 / total as f64
    } else {
        0.0
    };
    let throughput = if duration > Duration::ZERO {
        success_count as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    let latency = LatencyDistribution::from_samples(latencies);
    let verdict = slo.evaluate(success_rate, latency.p99);

    ConcurrencyTestResult {
        concurrency,
        duration,
        total_requests: total,
        success_count,
        timeout_count,
        error_count,
        success_rate,
        throughput,
        latency,
        queue_wait: LatencyDistribution::from_samples(queue_waits),
        resources,
        http2_layer_timeouts: http2_layer,
        server_layer_timeouts: server_layer,
        client_cancellations: client_cancelled,
        verdict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Timeline;
    use proptest::prelude::*;

    fn us(v: u64) -> Duration {
        Duration::from_micros(v)
    }

    fn success(latency_us: u64, enqueue: i64, dequeue: i64) -> Outcome {
        Outcome::Success {
            latency: us(latency_us),
            timeline: Timeline {
                arrival: 1,
                enqueue,
                dequeue,
                complete: dequeue + 10,
            },
            queue_depth_at_enqueue: 0,
        }
    }

    fn slo() -> Slo {
        Slo::builder().build()
    }

    #[test]
    fn percentile_uses_nearest_rank_exactly() {
        let sample: Vec<Duration> = (1..=100).map(us).collect();
        assert_eq!(percentile(&sample, 50.0), us(50));
        assert_eq!(percentile(&sample, 90.0), us(90));
        assert_eq!(percentile(&sample, 99.0), us(99));
        assert_eq!(percentile(&sample, 100.0), us(100));
        assert_eq!(percentile(&sample, 0.0), us(1));

        let ten: Vec<Duration> = (1..=10).map(us).collect();
        // ⌈99·10/100⌉ − 1 = 9 and ⌈90·10/100⌉ − 1 = 8
        assert_eq!(percentile(&ten, 99.0), us(10));
        assert_eq!(percentile(&ten, 90.0), us(9));
    }

    #[test]
    fn empty_sample_yields_zeroes() {
        assert_eq!(percentile(&[], 99.0), Duration::ZERO);
        let d = LatencyDistribution::from_samples(vec![]);
        assert_eq!(d, LatencyDistribution::default());
    }

    #[test]
    fn single_sample_pins_every_percentile() {
        let d = LatencyDistribution::from_samples(vec![us(123)]);
        assert_eq!(d.min, us(123));
        assert_eq!(d.p50, us(123));
        assert_eq!(d.p99, us(123));
        assert_eq!(d.max, us(123));
        assert_eq!(d.mean, us(123));
        assert_eq!(d.stddev, Duration::ZERO);
    }

    #[test]
    fn counts_partition_the_total() {
        let outcomes = vec![
            success(100, 2, 5),
            success(200, 2, 5),
            Outcome::Timeout {
                layer: TimeoutLayer::Http2ConnectionLayer,
            },
            Outcome::Timeout {
                layer: TimeoutLayer::ServerQueueWait,
            },
            Outcome::TransportError {
                message: "boom".into(),
            },
            Outcome::Cancelled,
        ];
        let r = evaluate_level(4, Duration::from_secs(1), &outcomes, ResourceSnapshot::default(), &slo());
        assert_eq!(r.total_requests, 6);
        assert_eq!(r.success_count, 2);
        assert_eq!(r.timeout_count, 3);
        assert_eq!(r.error_count, 1);
        assert_eq!(
            r.success_count + r.timeout_count + r.error_count,
            r.total_requests
        );
        assert_eq!(r.http2_layer_timeouts, 1);
        assert_eq!(r.server_layer_timeouts, 1);
        assert_eq!(r.client_cancellations, 1);
        assert!((r.success_rate - 2.0 / 6.0).abs() < 1e-9);
        assert!((r.throughput - 2.0).abs() < 1e-9);
    }

    #[test]
    fn queue_wait_skips_incomplete_timelines() {
        let outcomes = vec![
            success(100, 2, 7),
            // dequeue never stamped: excluded from the wait distribution
            success(100, 2, 0),
        ];
        let r = evaluate_level(2, Duration::from_secs(1), &outcomes, ResourceSnapshot::default(), &slo());
        assert_eq!(r.success_count, 2);
        assert_eq!(r.queue_wait.max, us(5));
        assert_eq!(r.queue_wait.min, us(5));
    }

    #[test]
    fn no_outcomes_yields_a_zeroed_result() {
        let r = evaluate_level(8, Duration::from_secs(1), &[], ResourceSnapshot::default(), &slo());
        assert_eq!(r.total_requests, 0);
        assert_eq!(r.success_rate, 0.0);
        assert_eq!(r.throughput, 0.0);
        assert_eq!(r.latency, LatencyDistribution::default());
    }

    #[test]
    fn zero_duration_yields_zero_throughput() {
        let r = evaluate_level(1, Duration::ZERO, &[success(10, 2, 5)], ResourceSnapshot::default(), &slo());
        assert_eq!(r.throughput, 0.0);
    }

    #[test]
    fn evaluation_is_pure() {
        let outcomes = vec![success(100, 2, 5), Outcome::Cancelled];
        let a = evaluate_level(2, Duration::from_secs(2), &outcomes, ResourceSnapshot::default(), &slo());
        let b = evaluate_level(2, Duration::from_secs(2), &outcomes, ResourceSnapshot::default(), &slo());
        assert_eq!(a, b);
    }

    proptest! {
        // The computed index always lands inside the sample.
        #[test]
        fn percentile_never_leaves_the_sample(
            mut raw in proptest::collection::vec(0u64..1_000_000, 1..200),
            p in 0.0f64..=100.0,
        ) {
            raw.sort_unstable();
            let sample: Vec<Duration> = raw.iter().copied().map(Duration::from_micros).collect();
            let v = percentile(&sample, p);
            prop_assert!(v >= sample[0] && v <= sample[sample.len() - 1]);
        }
    }
}

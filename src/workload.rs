//! Synthetic work unit.
//!
//! Service times are drawn log-uniformly over `[min_us, max_ms * 1000]`
//! microseconds, so a 50µs draw and a 50ms draw are equally plausible and
//! both the spin path and the sleep path get exercised. Sub-millisecond
//! delays are honored by busy-waiting on the monotonic clock (OS sleep
//! granularity cannot hit them), while longer delays coarse-sleep whole
//! milliseconds and spin the residual. Overruns are scheduling noise;
//! they show up in the observability data, not as errors.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use typed_builder::TypedBuilder;

/// Bounds of the service-time distribution.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct WorkloadSpec {
    /// Shortest service time, microseconds.
    #[builder(default = 10)]
    pub min_us: u64,
    /// Longest service time, milliseconds.
    #[builder(default = 50)]
    pub max_ms: u64,
    /// Fixed RNG seed for reproducible draws. `None` seeds from the OS.
    #[builder(default)]
    pub seed: Option<u64>,
}

/// Draws delays whose logarithm is uniform over the spec's bounds.
#[derive(Debug)]
pub struct DelaySampler {
    ln_min: f64,
    ln_max: f64,
    rng: StdRng,
}

impl DelaySampler {
    pub fn new(spec: WorkloadSpec) -> Self {
        let min_us = spec.min_us.max(1) as f64;
        let max_us = ((spec.max_ms.max(1)) * 1_000) as f64;
        let max_us = max_us.max(min_us);
        let rng = match spec.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            ln_min: min_us.ln(),
            ln_max: max_us.ln(),
            rng,
        }
    }

    pub fn sample(&mut self) -> Duration {
        let ln_d = self.rng.gen_range(self.ln_min..=self.ln_max);
        Duration::from_micros(ln_d.exp().round() as u64)
    }
}

/// Delays below this are pure spin; OS sleep cannot hit them.
const SPIN_ONLY_BELOW: Duration = Duration::from_millis(1);

fn spin_until(deadline: Instant) {
    while Instant::now() < deadline {
        hint::spin_loop();
    }
}

/// Block the current thread for approximately `delay`.
///
/// Must run on a dedicated OS thread, never on a runtime worker: the spin
/// tail would starve every other task sharing that worker.
pub fn execute(delay: Duration) {
    let deadline = Instant::now() + delay;
    if delay >= SPIN_ONLY_BELOW {
        thread::sleep(Duration::from_millis(delay.as_millis() as u64));
    }
    spin_until(deadline);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(min_us: u64, max_ms: u64) -> DelaySampler {
        DelaySampler::new(
            WorkloadSpec::builder()
                .min_us(min_us)
                .max_ms(max_ms)
                .seed(Some(7))
                .build(),
        )
    }

    #[test]
    fn samples_stay_within_bounds() {
        let mut s = sampler(10, 50);
        for _ in 0..10_000 {
            let d = s.sample();
            assert!(d >= Duration::from_micros(10), "draw below floor: {d:?}");
            // round() on the exponential can land one microsecond past the top
            assert!(d <= Duration::from_micros(50_001), "draw above ceiling: {d:?}");
        }
    }

    #[test]
    fn samples_cover_both_spin_and_sleep_regimes() {
        let mut s = sampler(10, 50);
        let mut sub_ms = 0usize;
        let mut multi_ms = 0usize;
        for _ in 0..10_000 {
            let d = s.sample();
            if d < Duration::from_millis(1) {
                sub_ms += 1;
            }
            if d >= Duration::from_millis(1) {
                multi_ms += 1;
            }
        }
        // ln-uniform over [10µs, 50ms]: the 1ms boundary sits roughly in the
        // middle of the log range, so both regimes must be well represented.
        assert!(sub_ms > 1_000, "only {sub_ms} sub-millisecond draws");
        assert!(multi_ms > 1_000, "only {multi_ms} multi-millisecond draws");
    }

    #[test]
    fn degenerate_bounds_collapse_to_a_point() {
        let mut s = DelaySampler::new(
            WorkloadSpec::builder()
                .min_us(1_000)
                .max_ms(1)
                .seed(Some(1))
                .build(),
        );
        for _ in 0..100 {
            assert_eq!(s.sample(), Duration::from_millis(1));
        }
    }

    #[test]
    fn execute_never_returns_early() {
        for delay in [Duration::from_micros(200), Duration::from_millis(3)] {
            let start = Instant::now();
            execute(delay);
            assert!(start.elapsed() >= delay);
        }
    }
}

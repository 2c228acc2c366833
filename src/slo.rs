//! Service-level objective: a success-rate floor paired with a P99 ceiling.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Slo {
    /// Minimum acceptable fraction of successful requests, in (0, 1].
    #[builder(default = 0.999)]
    pub min_success_rate: f64,
    /// Maximum acceptable P99 latency.
    #[builder(default = Duration::from_millis(200))]
    pub p99_ceiling: Duration,
}

/// Outcome of applying both predicates to one level. Empty `violations`
/// means a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SloVerdict {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl Slo {
    /// Pure and deterministic; no side effects.
    pub fn evaluate(&self, success_rate: f64, p99: Duration) -> SloVerdict {
        let mut violations = Vec::new();
        if success_rate < self.min_success_rate {
            violations.push(format!(
                "success rate {:.4} below floor {:.4}",
                success_rate, self.min_success_rate
            ));
        }
        if p99 > self.p99_ceiling {
            violations.push(format!(
                "P99 {:.1}ms above ceiling {:.1}ms",
                p99.as_secs_f64() * 1e3,
                self.p99_ceiling.as_secs_f64() * 1e3
            ));
        }
        SloVerdict {
            passed: violations.is_empty(),
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slo(rate: f64, p99_ms: u64) -> Slo {
        Slo::builder()
            .min_success_rate(rate)
            .p99_ceiling(Duration::from_millis(p99_ms))
            .build()
    }

    #[test]
    fn both_predicates_within_bounds_pass() {
        let verdict = slo(0.999, 200).evaluate(1.0, Duration::from_millis(40));
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn each_failed_predicate_is_named() {
        let verdict = slo(0.999, 200).evaluate(0.9, Duration::from_millis(500));
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 2);
        assert!(verdict.violations[0].contains("success rate"));
        assert!(verdict.violations[1].contains("P99"));
    }

    #[test]
    fn boundary_values_pass() {
        // floor and ceiling are inclusive
        let verdict = slo(0.999, 200).evaluate(0.999, Duration::from_millis(200));
        assert!(verdict.passed);
    }

    proptest! {
        // Loosening either threshold can never turn a pass into a fail.
        #[test]
        fn evaluation_is_monotone_in_thresholds(
            rate in 0.0f64..=1.0,
            p99_ms in 0u64..1_000,
            floor in 0.001f64..=1.0,
            ceiling_ms in 1u64..1_000,
            slack in 0.0f64..=0.5,
            extra_ms in 0u64..500,
        ) {
            let p99 = Duration::from_millis(p99_ms);
            let strict = slo(floor, ceiling_ms).evaluate(rate, p99);
            let loose = slo((floor - slack).max(0.0), ceiling_ms + extra_ms)
                .evaluate(rate, p99);
            prop_assert!(!strict.passed || loose.passed);
        }
    }
}

//! Reports and reporters.
//!
//! A [`ProbeReport`] is the rendering-ready view derived from a
//! [`ProbeResult`]; a [`Reporter`] consumes a finished report and performs
//! the side effects — printing a table, emitting JSON, or shipping it to
//! whatever sink an implementation targets. The split keeps the computation
//! layer (outcomes → levels → result) pure while reporters own presentation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::probe::ProbeResult;

/// One rendered row per tested level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelLine {
    pub concurrency: usize,
    pub requests: u64,
    pub success_rate: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub queue_wait_p99_ms: f64,
    pub peak_queue_depth: usize,
    pub throughput: f64,
    pub http2_layer_timeouts: u64,
    pub server_layer_timeouts: u64,
    pub passed: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub levels: Vec<LevelLine>,
    pub max_concurrency: usize,
    pub effective_concurrency: usize,
    pub saturated_throughput: f64,
    pub recommended_ceiling: usize,
    pub first_level_failed: bool,
    pub cancelled: bool,
}

impl From<&ProbeResult> for ProbeReport {
    fn from(result: &ProbeResult) -> Self {
        let levels = result
            .levels
            .iter()
            .map(|l| LevelLine {
                concurrency: l.concurrency,
                requests: l.total_requests,
                success_rate: l.success_rate,
                p50_ms: l.latency.p50.as_secs_f64() * 1e3,
                p99_ms: l.latency.p99.as_secs_f64() * 1e3,
                queue_wait_p99_ms: l.queue_wait.p99.as_secs_f64() * 1e3,
                peak_queue_depth: l.resources.peak_queue_depth,
                throughput: l.throughput,
                http2_layer_timeouts: l.http2_layer_timeouts,
                server_layer_timeouts: l.server_layer_timeouts,
                passed: l.verdict.passed,
                violations: l.verdict.violations.clone(),
            })
            .collect();
        Self {
            levels,
            max_concurrency: result.max_concurrency,
            effective_concurrency: result.effective_concurrency,
            saturated_throughput: result.saturated_throughput,
            recommended_ceiling: result.recommended_ceiling,
            first_level_failed: result.first_level_failed,
            cancelled: result.cancelled,
        }
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>6} {:>9} {:>9} {:>9} {:>9} {:>11} {:>7} {:>9} {:>6}",
            "K", "requests", "success%", "p50 ms", "p99 ms", "q-wait p99", "peak q", "rps", "slo"
        )?;
        for l in &self.levels {
            writeln!(
                f,
                "{:>6} {:>9} {:>9.3} {:>9.2} {:>9.2} {:>11.2} {:>7} {:>9.1} {:>6}",
                l.concurrency,
                l.requests,
                l.success_rate * 100.0,
                l.p50_ms,
                l.p99_ms,
                l.queue_wait_p99_ms,
                l.peak_queue_depth,
                l.throughput,
                if l.passed { "pass" } else { "FAIL" }
            )?;
            for violation in &l.violations {
                writeln!(f, "{:>6}   {}", "", violation)?;
            }
        }
        writeln!(f)?;
        if self.cancelled {
            writeln!(f, "probe cancelled; results cover completed levels only")?;
        }
        if self.first_level_failed {
            writeln!(
                f,
                "the first tested level already violated the SLO; lower \
                 --initial-concurrency or loosen the objective"
            )?;
        }
        writeln!(f, "max sustainable concurrency: {}", self.max_concurrency)?;
        writeln!(f, "effective concurrency:       {}", self.effective_concurrency)?;
        writeln!(
            f,
            "saturated throughput:        {:.1} req/s",
            self.saturated_throughput
        )?;
        write!(f, "recommended ceiling:         {}", self.recommended_ceiling)
    }
}

/// A [`Reporter`] consumes a [`ProbeReport`] and performs side effects —
/// displaying it, sending it to a service, or persisting it somewhere.
#[async_trait]
pub trait Reporter {
    async fn report(&self, report: &ProbeReport) -> Result<(), Box<dyn std::error::Error>>;
}

/// Human-readable table on stdout.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, report: &ProbeReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{report}");
        Ok(())
    }
}

/// Pretty-printed JSON on stdout, for piping into other tools.
pub struct JsonReporter;

#[async_trait]
impl Reporter for JsonReporter {
    async fn report(&self, report: &ProbeReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}

//! Headroom — an SLO-bounded concurrency prober for a single-consumer RPC
//! work queue.
//!
//! The harness answers three questions about a small unary RPC service whose
//! server-side work drains through one consumer: how many requests can stay
//! in flight before success rate or tail latency breaks the objective, where
//! the bottleneck sits (client-side connection multiplexing vs. the server
//! queue), and whether client tuning can raise the ceiling.
//!
//! # Architecture
//!
//! The main building blocks, leaves first:
//!
//! - [`workload`]: synthetic service times, log-uniform across four orders
//!   of magnitude, honored with a hybrid sleep/spin executor.
//! - [`WorkQueue`]: unbounded FIFO drained by one dedicated consumer thread;
//!   stamps a per-item [`queue::Timeline`] and keeps atomic telemetry.
//! - [`EmbeddedServer`]: loopback HTTP/2 listener adapting the `Process` RPC
//!   onto the queue, with client-abandonment propagation.
//! - [`ChannelPoolClient`]: round-robin pool of multiplexed channels with a
//!   client-side deadline; maps every terminal state to an [`Outcome`].
//! - [`SteadyStateEngine`]: holds exactly K requests in flight for a fixed
//!   window. Generic over the action, so tests can drive it without a
//!   server.
//! - [`ConcurrencyProber`]: warm → grow → bisect → verify → derive search
//!   that treats SLO failure as data.
//! - [`aggregate`] / [`Slo`]: pure reduction and scoring of raw outcomes.
//! - [`Reporter`]: the I/O boundary; table and JSON implementations ship.
//!
//! # Design goals
//!
//! - Measurements reflect the server, not the harness: the transport's
//!   stream ceiling is pushed aside by the channel pool, the queue is
//!   unbounded so saturation stays observable, and in-flight work is never
//!   preempted.
//! - Deterministic arithmetic: fixed nearest-rank percentiles, fixed
//!   bisection rule, fixed derivation of the reported ceilings.
//! - Everything behind trait seams ([`QueueTelemetry`], [`Reporter`], the
//!   engine's action) is replaceable without touching the search.

/// Reduction of raw outcomes into per-level results
pub mod aggregate;
/// Channel-pool gRPC client and per-call outcomes
pub mod client;
/// Process-wide monotonic tick source
pub mod clock;
/// Fixed-concurrency load engine
pub mod engine;
/// Generated protobuf types and service stubs
pub mod pb;
/// Adaptive concurrency search
pub mod probe;
/// Single-consumer work queue
pub mod queue;
/// Reports and reporters
pub mod report;
/// RPC adapter and embedded server
pub mod server;
/// Service-level objectives
pub mod slo;
/// Synthetic service-time workload
pub mod workload;

pub use aggregate::{ConcurrencyTestResult, LatencyDistribution};
pub use client::{ChannelPoolClient, ClientSettings, Outcome, TimeoutLayer};
pub use engine::{LevelRun, SteadyStateEngine};
pub use probe::{ConcurrencyProber, ProbeResult, ProbeSettings};
pub use queue::{NoTelemetry, QueueTelemetry, ResourceSnapshot, WorkQueue};
pub use report::{JsonReporter, ProbeReport, Reporter, StdoutReporter};
pub use server::{EmbeddedServer, ServerSettings};
pub use slo::{Slo, SloVerdict};
pub use workload::WorkloadSpec;

/// Failures that prevent a probe from starting at all. Everything that can
/// go wrong mid-probe is recorded as an [`Outcome`] instead.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid target address: {0}")]
    InvalidTarget(#[from] tonic::transport::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

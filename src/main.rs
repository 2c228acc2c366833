//! Command-line entry point: stands up the embedded server (or points at an
//! external one), wires the client pool into the engine and prober, runs the
//! requested mode and renders the report.
//!
//! Exit code 0 means the run completed; an SLO unmet at every level is
//! data, not failure. Nonzero means the harness itself could not run: port
//! bind failure, invalid configuration, and the like.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use headroom::{
    ChannelPoolClient, ClientSettings, ConcurrencyProber, HarnessError, JsonReporter, NoTelemetry,
    ProbeReport, ProbeSettings, QueueTelemetry, Reporter, ServerSettings, Slo, SteadyStateEngine,
    StdoutReporter, WorkQueue, WorkloadSpec, clock,
    server::EmbeddedServer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Adaptive search for the highest SLO-compliant level.
    Auto,
    /// Run the levels given via --concurrency, no search.
    Manual,
}

#[derive(Debug, Parser)]
#[command(
    name = "headroom",
    about = "Probe the maximum SLO-compliant concurrency of a single-consumer RPC queue"
)]
struct Cli {
    #[arg(long, value_enum, default_value = "auto")]
    mode: Mode,

    /// Concurrency levels for manual mode, comma separated.
    #[arg(long, value_delimiter = ',')]
    concurrency: Vec<usize>,

    /// Probe this server instead of starting the embedded one.
    #[arg(long)]
    external_server: Option<String>,

    /// Success-rate floor, in (0, 1].
    #[arg(long, default_value_t = 0.999)]
    success_rate: f64,

    /// P99 latency ceiling, milliseconds.
    #[arg(long, default_value_t = 200)]
    p99_threshold: u64,

    /// Warmup length, seconds.
    #[arg(long, default_value_t = 5)]
    warmup_duration: u64,

    /// Wall clock held at each searched level, seconds.
    #[arg(long, default_value_t = 10)]
    test_duration: u64,

    /// Stability verification length, seconds.
    #[arg(long, default_value_t = 30)]
    stability_duration: u64,

    /// Embedded server port; 0 picks an ephemeral one.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Channels the client round-robins over.
    #[arg(long, default_value_t = 8)]
    channel_pool_size: usize,

    /// Real HTTP/2 connections behind each channel.
    #[arg(long, default_value_t = 2)]
    connections_per_channel: usize,

    /// Client-side per-call deadline, milliseconds.
    #[arg(long, default_value_t = 1_000)]
    request_timeout: u64,

    /// First level of the exponential phase.
    #[arg(long, default_value_t = 20)]
    initial_concurrency: usize,

    /// Hard ceiling of the search.
    #[arg(long, default_value_t = 1_024)]
    max_concurrency: usize,

    /// Shortest synthetic service time, microseconds.
    #[arg(long, default_value_t = 10)]
    work_min_us: u64,

    /// Longest synthetic service time, milliseconds.
    #[arg(long, default_value_t = 50)]
    work_max_ms: u64,

    /// Emit the report as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

fn validate(cli: &Cli) -> Result<(), HarnessError> {
    if !(cli.success_rate > 0.0 && cli.success_rate <= 1.0) {
        return Err(HarnessError::InvalidConfig(format!(
            "--success-rate must be in (0, 1], got {}",
            cli.success_rate
        )));
    }
    if cli.mode == Mode::Manual && cli.concurrency.is_empty() {
        return Err(HarnessError::InvalidConfig(
            "--mode manual needs at least one --concurrency level".into(),
        ));
    }
    if cli.initial_concurrency == 0 || cli.initial_concurrency > cli.max_concurrency {
        return Err(HarnessError::InvalidConfig(format!(
            "--initial-concurrency {} must be in [1, {}]",
            cli.initial_concurrency, cli.max_concurrency
        )));
    }
    if cli.work_min_us == 0 || cli.work_min_us > cli.work_max_ms * 1_000 {
        return Err(HarnessError::InvalidConfig(format!(
            "work bounds [{}us, {}ms] are inverted or empty",
            cli.work_min_us, cli.work_max_ms
        )));
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    validate(&cli)?;
    clock::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(4))
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing the current level");
            let _ = cancel_tx.send(true);
        }
    });

    // Embedded mode owns a queue and a server; external mode probes a remote
    // target it has no telemetry for.
    let mut embedded = None;
    let (target, telemetry): (String, Arc<dyn QueueTelemetry>) = match &cli.external_server {
        Some(url) => (url.clone(), Arc::new(NoTelemetry)),
        None => {
            let queue = WorkQueue::start(
                WorkloadSpec::builder()
                    .min_us(cli.work_min_us)
                    .max_ms(cli.work_max_ms)
                    .build(),
            );
            let server = EmbeddedServer::bind(
                ServerSettings::builder().port(cli.port).build(),
                Arc::clone(&queue),
            )
            .await?;
            let target = server.target_uri();
            tracing::info!(%target, "embedded server listening");
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let serve_task = tokio::spawn(server.serve(shutdown_rx));
            let telemetry: Arc<dyn QueueTelemetry> = Arc::clone(&queue) as Arc<dyn QueueTelemetry>;
            embedded = Some((queue, shutdown_tx, serve_task));
            (target, telemetry)
        }
    };

    let client = Arc::new(ChannelPoolClient::connect(
        &ClientSettings::builder()
            .target(target)
            .pool_size(cli.channel_pool_size)
            .connections_per_channel(cli.connections_per_channel)
            .request_timeout(Duration::from_millis(cli.request_timeout))
            .build(),
    )?);
    let action = {
        let client = Arc::clone(&client);
        move || {
            let client = Arc::clone(&client);
            async move { client.call_once().await }
        }
    };

    let prober = ConcurrencyProber::new(
        SteadyStateEngine::new(action),
        telemetry,
        Slo::builder()
            .min_success_rate(cli.success_rate)
            .p99_ceiling(Duration::from_millis(cli.p99_threshold))
            .build(),
        ProbeSettings::builder()
            .warmup_duration(Duration::from_secs(cli.warmup_duration))
            .test_duration(Duration::from_secs(cli.test_duration))
            .stability_duration(Duration::from_secs(cli.stability_duration))
            .initial_concurrency(cli.initial_concurrency)
            .max_concurrency(cli.max_concurrency)
            .build(),
    );

    let result = match cli.mode {
        Mode::Auto => prober.probe(cancel_rx).await,
        Mode::Manual => prober.run_schedule(&cli.concurrency, cancel_rx).await,
    };

    let report = ProbeReport::from(&result);
    let reporter: Box<dyn Reporter> = if cli.json {
        Box::new(JsonReporter)
    } else {
        Box::new(StdoutReporter)
    };
    reporter
        .report(&report)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    if let Some((queue, shutdown_tx, serve_task)) = embedded {
        let _ = shutdown_tx.send(true);
        queue.shutdown(Duration::from_secs(2));
        let _ = serve_task.await;
    }
    Ok(())
}

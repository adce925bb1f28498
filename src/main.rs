use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::adaptive::{spawn_pressure_sampler, AdaptiveAdmissionController, ProcStatSampler};
use floodgate::config::FloodgateConfig;
use floodgate::middleware::{AdmissionMiddleware, Handler, RejectReason, RequestContext};
use floodgate::ratelimit::{LimiterRegistry, OperationLimitSpec};

/// Drive simulated traffic through the admission layer.
#[derive(Parser, Debug)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent client loops
    #[arg(short, long, default_value_t = 64)]
    workers: usize,

    /// How long to run before printing the summary
    #[arg(short, long, default_value_t = 10)]
    duration_secs: u64,

    /// Simulated handler latency in milliseconds
    #[arg(long, default_value_t = 5)]
    work_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Stand-in for a real service method.
struct SimulatedService {
    work: Duration,
}

#[async_trait]
impl Handler for SimulatedService {
    type Request = u64;
    type Response = u64;

    async fn call(&self, _ctx: &RequestContext, request: u64) -> Result<u64, Status> {
        tokio::time::sleep(self.work).await;
        Ok(request)
    }
}

#[derive(Default)]
struct Tally {
    ok: AtomicU64,
    overloaded: AtomicU64,
    rate_limited: AtomicU64,
    misconfigured: AtomicU64,
    canceled: AtomicU64,
    failed: AtomicU64,
}

impl Tally {
    fn record(&self, result: &Result<u64, Status>) {
        let counter = match result {
            Ok(_) => &self.ok,
            Err(status) => match RejectReason::from_status(status) {
                Some(RejectReason::Overloaded) => &self.overloaded,
                Some(RejectReason::RateLimited) => &self.rate_limited,
                Some(RejectReason::Misconfigured) => &self.misconfigured,
                Some(RejectReason::Canceled) => &self.canceled,
                None => &self.failed,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn demo_operations() -> Vec<OperationLimitSpec> {
    vec![
        OperationLimitSpec::new("/floodgate.demo.Echo/Say", 500.0, 100, Duration::from_millis(20)),
        OperationLimitSpec::new("/floodgate.demo.Echo/Shout", 50.0, 10, Duration::ZERO),
    ]
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Floodgate admission demo");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => FloodgateConfig::load(path)?,
        None => FloodgateConfig::default(),
    };
    if config.operations.is_empty() {
        config.operations = demo_operations();
    }
    info!(
        operations = config.operations.len(),
        global_tier = config.controller.enabled,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    let controller = if config.controller.enabled {
        let controller = Arc::new(AdaptiveAdmissionController::new(&config.controller));
        spawn_pressure_sampler(
            controller.clone(),
            ProcStatSampler::new(),
            config.controller.sample_interval(),
            shutdown.clone(),
        );
        Some(controller)
    } else {
        None
    };

    let registry = Arc::new(LimiterRegistry::from_specs(&config.operations)?);
    let middleware = Arc::new(
        AdmissionMiddleware::new(
            controller.clone(),
            registry.clone(),
            SimulatedService {
                work: Duration::from_millis(cli.work_ms),
            },
        )
        .with_rejection_policy(config.controller.rejection_policy),
    );

    if let Some(path) = cli.config.clone() {
        spawn_reload_on_hangup(path, registry.clone(), shutdown.clone());
    }

    let tally = Arc::new(Tally::default());
    let operations = registry.operations();
    let mut workers = Vec::with_capacity(cli.workers);
    for worker in 0..cli.workers {
        let middleware = middleware.clone();
        let tally = tally.clone();
        let shutdown = shutdown.clone();
        let operation = operations[worker % operations.len()].clone();
        workers.push(tokio::spawn(async move {
            let mut seq = 0u64;
            while !shutdown.is_cancelled() {
                let ctx = RequestContext::new(operation.as_str())
                    .with_cancellation(shutdown.child_token());
                let result = middleware.handle(&ctx, seq).await;
                tally.record(&result);
                if result.is_err() {
                    tokio::task::yield_now().await;
                }
                seq += 1;
            }
        }));
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {
            info!(duration_secs = cli.duration_secs, "Run complete");
        }
        _ = shutdown_signal() => {}
    }
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task failed");
        }
    }

    info!(
        ok = tally.ok.load(Ordering::Relaxed),
        overloaded = tally.overloaded.load(Ordering::Relaxed),
        rate_limited = tally.rate_limited.load(Ordering::Relaxed),
        misconfigured = tally.misconfigured.load(Ordering::Relaxed),
        canceled = tally.canceled.load(Ordering::Relaxed),
        failed = tally.failed.load(Ordering::Relaxed),
        "Request summary"
    );
    if let Some(controller) = &controller {
        let snapshot = controller.snapshot();
        info!(
            estimator = snapshot.estimator,
            ceiling = ?snapshot.ceiling,
            pressure = snapshot.pressure,
            max_pass = snapshot.max_pass,
            min_rt_ms = snapshot.min_rt.as_secs_f64() * 1000.0,
            "Controller state"
        );
    }
    for operation in &operations {
        if let Some(bucket) = registry.resolve(operation) {
            let snapshot = bucket.snapshot();
            info!(
                operation = %operation,
                rate = snapshot.rate,
                burst = snapshot.burst,
                available = snapshot.available_tokens,
                "Bucket state"
            );
        }
    }

    info!("Floodgate admission demo stopped");
    Ok(())
}

/// Re-read the configuration file on SIGHUP and swap in its operation limits.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    path: PathBuf,
    registry: Arc<LimiterRegistry>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler, reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            let reloaded = FloodgateConfig::load(&path)
                .and_then(|config| registry.replace_all(&config.operations));
            match reloaded {
                Ok(()) => info!(operations = registry.len(), "Operation limits reloaded"),
                Err(e) => warn!(error = %e, "Reload rejected, keeping previous limits"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _path: PathBuf,
    _registry: Arc<LimiterRegistry>,
    _shutdown: CancellationToken,
) {
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tempo::config::{LoggingConfig, TempoConfig};
use tempo::ratelimit::{AdaptiveRateLimiter, LimiterConfig, LimiterRegistry, LimiterState, LimiterStats};
use tempo::upstream::{throttled, UpstreamResponse};

/// Adaptive rate limiter for upstream API calls.
#[derive(Debug, Parser)]
#[command(name = "tempo", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration
    Check,
    /// Print the state of every configured limiter as JSON
    State,
    /// Drive a limiter against a simulated upstream
    Simulate {
        /// Configured upstream to use; a default limiter when omitted
        #[arg(long)]
        upstream: Option<String>,

        /// Total number of requests to send
        #[arg(long, default_value_t = 50)]
        requests: u64,

        /// Number of concurrent workers
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Probability that the upstream answers 429
        #[arg(long, default_value_t = 0.05)]
        throttle_probability: f64,

        /// Retry-After seconds sent with each 429
        #[arg(long, default_value_t = 1.0)]
        retry_after: f64,

        /// Simulated upstream latency in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
    },
}

/// Response produced by the simulated upstream.
struct SimulatedResponse {
    status: u16,
    retry_after: Option<String>,
}

impl UpstreamResponse for SimulatedResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn retry_after(&self) -> Option<&str> {
        self.retry_after.as_deref()
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    successes: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    upstream: String,
    requests_sent: u64,
    successes: u64,
    rate_limited: u64,
    elapsed_secs: f64,
    state: LimiterState,
    stats: LimiterStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TempoConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.log_json);

    info!("Starting Tempo");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        source = %config_source(cli.config.as_deref()),
        upstreams = config.upstreams.len(),
        "Configuration loaded"
    );

    let registry = LimiterRegistry::from_config(&config)?;

    match cli.command {
        Command::Check => {
            for name in registry.names() {
                println!("{}", name);
            }
            info!(upstreams = registry.len(), "Configuration is valid");
        }
        Command::State => {
            println!("{}", serde_json::to_string_pretty(&registry.states())?);
        }
        Command::Simulate {
            upstream,
            requests,
            concurrency,
            throttle_probability,
            retry_after,
            latency_ms,
        } => {
            if !(0.0..=1.0).contains(&throttle_probability) {
                bail!("throttle probability must be between 0 and 1");
            }
            if concurrency == 0 {
                bail!("concurrency must be at least 1");
            }

            let limiter = match upstream {
                Some(name) => registry
                    .get(&name)
                    .ok_or_else(|| anyhow!("unknown upstream '{}'", name))?,
                None => registry.get_or_create("default", LimiterConfig::default())?,
            };

            let report = simulate(
                limiter,
                requests,
                concurrency,
                throttle_probability,
                retry_after,
                Duration::from_millis(latency_ms),
            )
            .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Describe where the configuration came from, for the startup log.
fn config_source(path: Option<&Path>) -> String {
    match path {
        Some(path) => format!("{} + environment", path.display()),
        None => "environment".to_string(),
    }
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json || force_json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn simulate(
    limiter: Arc<AdaptiveRateLimiter>,
    requests: u64,
    concurrency: usize,
    throttle_probability: f64,
    retry_after: f64,
    latency: Duration,
) -> SimulationReport {
    info!(
        upstream = %limiter.name(),
        requests = requests,
        concurrency = concurrency,
        "Starting simulation"
    );

    let counters = Arc::new(Counters::default());
    let next_request = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let workers: Vec<_> = (0..concurrency)
        .map(|_| {
            let limiter = limiter.clone();
            let counters = counters.clone();
            let next_request = next_request.clone();
            tokio::spawn(async move {
                while next_request.fetch_add(1, Ordering::SeqCst) < requests {
                    let response = throttled(limiter.as_ref(), || {
                        simulated_upstream(throttle_probability, retry_after, latency)
                    })
                    .await;

                    counters.sent.fetch_add(1, Ordering::SeqCst);
                    if response.status == 429 {
                        counters.rate_limited.fetch_add(1, Ordering::SeqCst);
                    } else {
                        counters.successes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    tokio::select! {
        _ = join_all(workers) => {
            info!("Simulation finished");
        }
        _ = shutdown_signal() => {
            warn!("Simulation interrupted");
        }
    }

    SimulationReport {
        upstream: limiter.name().to_string(),
        requests_sent: counters.sent.load(Ordering::SeqCst),
        successes: counters.successes.load(Ordering::SeqCst),
        rate_limited: counters.rate_limited.load(Ordering::SeqCst),
        elapsed_secs: start.elapsed().as_secs_f64(),
        state: limiter.state(),
        stats: limiter.stats(),
    }
}

async fn simulated_upstream(
    throttle_probability: f64,
    retry_after: f64,
    latency: Duration,
) -> SimulatedResponse {
    let limited = rand::thread_rng().gen_bool(throttle_probability);
    tokio::time::sleep(latency).await;

    if limited {
        SimulatedResponse {
            status: 429,
            retry_after: Some(retry_after.to_string()),
        }
    } else {
        SimulatedResponse {
            status: 200,
            retry_after: None,
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_source_description() {
        assert_eq!(config_source(None), "environment");
        assert_eq!(
            config_source(Some(Path::new("/etc/tempo.yaml"))),
            "/etc/tempo.yaml + environment"
        );
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "tempo",
            "--config",
            "/etc/tempo.yaml",
            "simulate",
            "--upstream",
            "spotify",
            "--requests",
            "10",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some(Path::new("/etc/tempo.yaml")));
        match cli.command {
            Command::Simulate {
                upstream, requests, ..
            } => {
                assert_eq!(upstream.as_deref(), Some("spotify"));
                assert_eq!(requests, 10);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}

use anyhow::Context;
use clap::Parser;
use heartbeat_lock::{HeartbeatGuard, Lease, LockConfig, LockError};
use std::{process::ExitStatus, time::Duration};
use tokio::{process::Command, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// EX_TEMPFAIL from sysexits.h
const EXIT_BUSY: i32 = 75;

#[derive(Parser, Debug)]
#[command(name = "heartbeat-lock")]
#[command(about = "Run a command while holding a Redis lease")]
struct Args {
    /// Key to lock
    #[arg(long)]
    key: String,

    /// Redis URL (default: REDIS_URL, or REDIS_HOST/REDIS_PORT/REDIS_DB)
    #[arg(long)]
    redis_url: Option<String>,

    /// Lease TTL in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// Seconds to keep retrying acquisition
    #[arg(long)]
    timeout: Option<f64>,

    /// Seconds between acquisition attempts
    #[arg(long)]
    retry_interval: Option<f64>,

    /// Seconds between renewals (default: half the TTL)
    #[arg(long)]
    period: Option<f64>,

    /// Command to run while the lock is held
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    /// Environment configuration with any flags applied on top.
    fn config(&self) -> anyhow::Result<LockConfig> {
        let mut config = LockConfig::from_env()?;

        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        if let Some(ttl) = self.ttl {
            config.ttl_seconds = ttl;
        }
        if let Some(timeout) = seconds("timeout", self.timeout)? {
            config.acquisition_timeout = timeout;
        }
        if let Some(retry) = seconds("retry-interval", self.retry_interval)? {
            config.retry_interval = retry;
        }
        if let Some(period) = seconds("period", self.period)? {
            config.renewal_period = Some(period);
        }

        config.validate()?;
        Ok(config)
    }
}

fn seconds(flag: &str, value: Option<f64>) -> anyhow::Result<Option<Duration>> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("--{} must be a non-negative number of seconds", flag))
        })
        .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "heartbeat_lock=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.config()?;

    let lease = Lease::connect(args.key.clone(), &config).await?;
    let mut guard = HeartbeatGuard::new(config.effective_renewal_period(), lease)?;
    info!(
        "Running {:?} under lock {} (ttl {}s, renew every {:?})",
        args.command,
        args.key,
        config.ttl_seconds,
        guard.period()
    );

    let code = tokio::select! {
        result = guard.run(|| run_child(&args.command)) => exit_code(result)?,
        code = shutdown_signal() => code,
    };

    // Only does anything when a signal interrupted the run above
    if let Err(e) = guard.exit().await {
        warn!("Failed to release {} on shutdown: {}", args.key, e);
    }

    std::process::exit(code);
}

async fn run_child(command: &[String]) -> anyhow::Result<ExitStatus> {
    let (program, rest) = command.split_first().context("no command given")?;

    // The child is killed if the lease is lost and this future is dropped
    let status = Command::new(program)
        .args(rest)
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("failed to run {}", program))?;

    Ok(status)
}

fn exit_code(result: anyhow::Result<ExitStatus>) -> anyhow::Result<i32> {
    match result {
        // No code means the child was killed by a signal
        Ok(status) => Ok(status.code().unwrap_or(1)),
        Err(e) if e.downcast_ref::<LockError>().is_some_and(LockError::is_busy) => {
            warn!("{}", e);
            Ok(EXIT_BUSY)
        }
        Err(e) => Err(e),
    }
}

async fn shutdown_signal() -> i32 {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, releasing lock");
            130
        },
        _ = terminate => {
            info!("Received SIGTERM, releasing lock");
            143
        }
    }
}

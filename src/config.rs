use std::{env, time::Duration};

use url::Url;

use crate::error::{LockError, Result};

pub const DEFAULT_TTL_SECONDS: u64 = 8;
pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_REDIS_DB: i64 = 0;
/// Longest TTL accepted. Redis refuses an `EX` that overflows its
/// millisecond clock, and deadlines must fit in an `Instant`.
pub const MAX_TTL_SECONDS: u64 = i32::MAX as u64;

/// Timing and connection settings shared by a lease and its heartbeat guard.
#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    pub ttl_seconds: u64,
    pub acquisition_timeout: Duration,
    pub retry_interval: Duration,
    /// `None` means half the TTL.
    pub renewal_period: Option<Duration>,
    pub redis_url: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            acquisition_timeout: DEFAULT_ACQUISITION_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            renewal_period: None,
            redis_url: format!(
                "redis://{}:{}/{}",
                DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT, DEFAULT_REDIS_DB
            ),
        }
    }
}

impl LockConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let redis_url = match env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| DEFAULT_REDIS_HOST.to_string());
                let port = match env::var("REDIS_PORT") {
                    Ok(raw) => raw
                        .parse::<u16>()
                        .map_err(|e| anyhow::anyhow!("REDIS_PORT must be a port number: {}", e))?,
                    Err(_) => DEFAULT_REDIS_PORT,
                };
                let db = match env::var("REDIS_DB") {
                    Ok(raw) => raw
                        .parse::<i64>()
                        .map_err(|e| anyhow::anyhow!("REDIS_DB must be an integer: {}", e))?,
                    Err(_) => DEFAULT_REDIS_DB,
                };
                redis_url_from_parts(&host, port, db)?
            }
        };

        let ttl_seconds = match env::var("LOCK_TTL_SECONDS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|e| anyhow::anyhow!("LOCK_TTL_SECONDS must be a whole number: {}", e))?,
            Err(_) => defaults.ttl_seconds,
        };

        let config = LockConfig {
            ttl_seconds,
            acquisition_timeout: duration_from_env("LOCK_ACQUISITION_TIMEOUT_SECS")?
                .unwrap_or(defaults.acquisition_timeout),
            retry_interval: duration_from_env("LOCK_RETRY_INTERVAL_SECS")?
                .unwrap_or(defaults.retry_interval),
            renewal_period: duration_from_env("LOCK_RENEWAL_PERIOD_SECS")?,
            redis_url,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Renewal period actually used by a guard built from this config.
    pub fn effective_renewal_period(&self) -> Duration {
        self.renewal_period.unwrap_or_else(|| self.ttl() / 2)
    }

    pub fn validate(&self) -> Result<()> {
        validate_timings(
            self.ttl_seconds,
            self.acquisition_timeout,
            self.retry_interval,
        )?;
        validate_period(self.effective_renewal_period(), self.ttl())?;
        Ok(())
    }
}

/// Checks the relationship between TTL, acquisition timeout and retry interval.
pub fn validate_timings(
    ttl_seconds: u64,
    acquisition_timeout: Duration,
    retry_interval: Duration,
) -> Result<()> {
    if ttl_seconds == 0 {
        return Err(LockError::invalid_config("ttl must be at least one second"));
    }
    if ttl_seconds > MAX_TTL_SECONDS {
        return Err(LockError::invalid_config(format!(
            "ttl {}s exceeds the maximum of {}s",
            ttl_seconds, MAX_TTL_SECONDS
        )));
    }
    if retry_interval.is_zero() {
        return Err(LockError::invalid_config("retry interval must be positive"));
    }
    if retry_interval >= acquisition_timeout {
        return Err(LockError::invalid_config(format!(
            "retry interval {:?} must be shorter than acquisition timeout {:?}",
            retry_interval, acquisition_timeout
        )));
    }
    if retry_interval >= Duration::from_secs(ttl_seconds) {
        return Err(LockError::invalid_config(format!(
            "retry interval {:?} must be shorter than ttl {}s",
            retry_interval, ttl_seconds
        )));
    }
    Ok(())
}

pub fn validate_period(period: Duration, ttl: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(LockError::invalid_config("renewal period must be positive"));
    }
    if period >= ttl {
        return Err(LockError::invalid_config(format!(
            "renewal period {:?} must be shorter than ttl {:?}",
            period, ttl
        )));
    }
    Ok(())
}

pub fn redis_url_from_parts(host: &str, port: u16, db: i64) -> anyhow::Result<String> {
    let mut url = Url::parse("redis://localhost")?;
    url.set_host(Some(host))
        .map_err(|e| anyhow::anyhow!("Invalid Redis host {:?}: {}", host, e))?;
    url.set_port(Some(port))
        .map_err(|_| anyhow::anyhow!("Invalid Redis port {}", port))?;
    url.set_path(&format!("/{}", db));
    Ok(url.to_string())
}

fn duration_from_env(name: &str) -> anyhow::Result<Option<Duration>> {
    match env::var(name) {
        Ok(raw) => {
            let secs = raw
                .parse::<f64>()
                .map_err(|e| anyhow::anyhow!("{} must be a number of seconds: {}", name, e))?;
            let duration = Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow::anyhow!("{} is out of range: {}", name, e))?;
            Ok(Some(duration))
        }
        Err(_) => Ok(None),
    }
}

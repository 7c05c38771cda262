//! Application configuration loaded from environment variables.
//!
//! Required: `REDEMPTION_SERVICE_URL`
//! Optional: `REDEMPTION_TIMEOUT_SECS`, `HTTP_HOST`, `HTTP_PORT`,
//!           `MAX_RETRIES`, `INITIAL_BACKOFF_MS`, `BACKOFF_FACTOR`,
//!           `MAX_BACKOFF_MS`, `BACKOFF_JITTER`, `FINAL_PAYMENT_FAILURE_STATUS`,
//!           `PROCESS_INTERVAL_SECS`, `BATCH_TIMEOUT_SECS`, `SEED_PATH`

use anyhow::{Context, Result, anyhow};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::processor::FinalFailureStatus;
use crate::redeemer::RetryPolicy;

/// Application configuration for the redemption backend.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of the delegation-redemption service.
    pub redemption_service_url: String,
    /// HTTP timeout for one redemption call.
    pub redemption_timeout: Duration,
    pub http_host: String,
    pub http_port: u16,
    pub retry: RetryPolicy,
    /// Status applied when the final payment of a fixed-term subscription fails.
    pub final_failure_status: FinalFailureStatus,
    /// Interval of the background batch run. `None` disables the scheduler.
    pub process_interval: Option<Duration>,
    /// Deadline for one batch run.
    pub batch_timeout: Option<Duration>,
    /// JSON fixture loaded into the in-memory store at start-up.
    pub seed_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let redemption_service_url = lookup("REDEMPTION_SERVICE_URL")
            .filter(|v| !v.trim().is_empty())
            .context("REDEMPTION_SERVICE_URL env var must be set")?;

        let redemption_timeout =
            Duration::from_secs(parse_or(&lookup, "REDEMPTION_TIMEOUT_SECS", 60)?);

        let http_host = lookup("HTTP_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let http_port = parse_or(&lookup, "HTTP_PORT", 8080)?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "MAX_RETRIES", defaults.max_attempts)?,
            initial_backoff: Duration::from_millis(parse_or(
                &lookup,
                "INITIAL_BACKOFF_MS",
                defaults.initial_backoff.as_millis() as u64,
            )?),
            backoff_factor: parse_or(&lookup, "BACKOFF_FACTOR", defaults.backoff_factor)?,
            max_backoff: Duration::from_millis(parse_or(
                &lookup,
                "MAX_BACKOFF_MS",
                defaults.max_backoff.as_millis() as u64,
            )?),
            jitter: parse_or(&lookup, "BACKOFF_JITTER", defaults.jitter)?,
        };
        if retry.max_attempts == 0 {
            return Err(anyhow!("MAX_RETRIES must be at least 1"));
        }
        if !(0.0..1.0).contains(&retry.jitter) {
            return Err(anyhow!("BACKOFF_JITTER must be in [0, 1), got {}", retry.jitter));
        }

        let final_failure_status = lookup("FINAL_PAYMENT_FAILURE_STATUS")
            .map(|v| v.parse::<FinalFailureStatus>())
            .transpose()
            .map_err(|e| anyhow!(e))
            .context("invalid FINAL_PAYMENT_FAILURE_STATUS")?
            .unwrap_or_default();

        let process_interval = parse_opt::<u64>(&lookup, "PROCESS_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let batch_timeout = parse_opt::<u64>(&lookup, "BATCH_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let seed_path = lookup("SEED_PATH").filter(|v| !v.trim().is_empty());

        Ok(Self {
            redemption_service_url,
            redemption_timeout,
            http_host,
            http_port,
            retry,
            final_failure_status,
            process_interval,
            batch_timeout,
            seed_path,
        })
    }

    pub fn bind_addr(&self) -> (String, u16) {
        (self.http_host.clone(), self.http_port)
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("{e}"))
                .with_context(|| format!("invalid {name}: {raw}"))
        })
        .transpose()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(lookup, name)?.unwrap_or(default))
}

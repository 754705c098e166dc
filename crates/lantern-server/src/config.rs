use std::time::Duration;

use anyhow::Context;
use tracing::warn;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_IDLE_AFTER_MIN: u64 = 15;
const DEFAULT_IDLE_CHECK_INTERVAL_SECS: u64 = 30;
const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 600;
const DEFAULT_TEARDOWN_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TEARDOWN_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_TEARDOWN_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 32;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub api_key: String,
    pub accepted_origin: String,
}

/// Knobs that shape the lifecycle orchestrator.
#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// `None` disables the idle-timeout policy.
    pub idle_after: Option<Duration>,
    pub idle_check_interval: Duration,
    pub provision_timeout: Duration,
    pub teardown_max_attempts: u32,
    pub teardown_backoff_base: Duration,
    pub teardown_backoff_max: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_after: Some(Duration::from_secs(DEFAULT_IDLE_AFTER_MIN * 60)),
            idle_check_interval: Duration::from_secs(DEFAULT_IDLE_CHECK_INTERVAL_SECS),
            provision_timeout: Duration::from_secs(DEFAULT_PROVISION_TIMEOUT_SECS),
            teardown_max_attempts: DEFAULT_TEARDOWN_MAX_ATTEMPTS,
            teardown_backoff_base: Duration::from_millis(DEFAULT_TEARDOWN_BACKOFF_BASE_MS),
            teardown_backoff_max: Duration::from_millis(DEFAULT_TEARDOWN_BACKOFF_MAX_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub public_ws_base_url: Option<String>,
    pub cost_per_hour: f64,
    pub subscriber_queue_capacity: usize,
    pub shutdown_grace: Duration,
    pub security: SecurityConfig,
    pub lifecycle: LifecycleConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let security = SecurityConfig {
            api_key: required_non_empty_env("API_KEY")
                .context("API_KEY must be set (for example in .env)")?,
            accepted_origin: required_non_empty_env("ACCEPTED_ORIGIN")
                .context("ACCEPTED_ORIGIN must be set (for example in .env)")?,
        };

        let port = match std::env::var("PORT") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("parse PORT={raw}"))?,
            _ => DEFAULT_PORT,
        };

        let cost_per_hour = match std::env::var("COST_PER_HOUR") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<f64>()
                .with_context(|| format!("parse COST_PER_HOUR={raw}"))?,
            _ => 0.0,
        };

        let idle_after_min = env_u64("IDLE_AFTER_MIN").unwrap_or(DEFAULT_IDLE_AFTER_MIN);
        if idle_after_min == 0 {
            warn!("IDLE_AFTER_MIN=0 set; running instances will never be stopped for inactivity");
        }

        let teardown_max_attempts = env_u64("TEARDOWN_MAX_ATTEMPTS")
            .map(|v| v.clamp(1, u64::from(u32::MAX)) as u32)
            .unwrap_or(DEFAULT_TEARDOWN_MAX_ATTEMPTS);
        let teardown_backoff_base = Duration::from_millis(
            env_u64("TEARDOWN_BACKOFF_BASE_MS").unwrap_or(DEFAULT_TEARDOWN_BACKOFF_BASE_MS),
        );
        let teardown_backoff_max = Duration::from_millis(
            env_u64("TEARDOWN_BACKOFF_MAX_MS").unwrap_or(DEFAULT_TEARDOWN_BACKOFF_MAX_MS),
        )
        .max(teardown_backoff_base);

        Ok(Self {
            port,
            public_ws_base_url: std::env::var("PUBLIC_WS_BASE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            cost_per_hour,
            subscriber_queue_capacity: env_usize("SUBSCRIBER_QUEUE_CAPACITY")
                .unwrap_or(DEFAULT_SUBSCRIBER_QUEUE_CAPACITY)
                .max(1),
            shutdown_grace: Duration::from_secs(
                env_u64("SHUTDOWN_GRACE_SECS").unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
            security,
            lifecycle: LifecycleConfig {
                idle_after: (idle_after_min > 0)
                    .then(|| Duration::from_secs(idle_after_min * 60)),
                idle_check_interval: Duration::from_secs(
                    env_u64("IDLE_CHECK_INTERVAL_SECS")
                        .unwrap_or(DEFAULT_IDLE_CHECK_INTERVAL_SECS)
                        .max(1),
                ),
                provision_timeout: Duration::from_secs(
                    env_u64("PROVISION_TIMEOUT_SECS").unwrap_or(DEFAULT_PROVISION_TIMEOUT_SECS),
                ),
                teardown_max_attempts,
                teardown_backoff_base,
                teardown_backoff_max,
            },
        })
    }

    /// Idle timeout in minutes as reported to clients (`0` when disabled).
    pub fn idle_after_min(&self) -> f64 {
        self.lifecycle
            .idle_after
            .map(|d| d.as_secs_f64() / 60.0)
            .unwrap_or(0.0)
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "off" => Some(false),
        _ => None,
    })
}

pub fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
}

pub fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

pub fn required_non_empty_env(key: &str) -> anyhow::Result<String> {
    let value = std::env::var(key).with_context(|| format!("{key} must be set"))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        anyhow::bail!("{key} must be non-empty");
    }
    Ok(trimmed.to_string())
}

pub fn optional_non_empty_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

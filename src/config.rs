use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime settings for one broker session.
///
/// Loaded from a TOML file (either a `[session]` table or top-level keys), then
/// patched from `CTRADER_*` environment variables and validated.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub account_id: i64,
    /// Lifetime of `access_token` counted from session start.
    #[serde(default = "default_token_lifetime")]
    pub token_expires_in_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: f64,
    #[serde(default = "default_login_flow_timeout")]
    pub login_flow_timeout_secs: f64,
    /// Extra attempts after the first one; 0 disables retries.
    #[serde(default)]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: f64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: f64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: f64,
    /// 0 means the first failure is fatal.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_jitter_ratio")]
    pub reconnect_jitter_ratio: f64,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: f64,
    #[serde(default = "default_refresh_margin")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_watchdog_tick")]
    pub watchdog_tick_secs: f64,
    #[serde(default = "default_grace_multiple")]
    pub watchdog_grace_multiple: u32,
    #[serde(default = "default_miss_threshold")]
    pub watchdog_miss_threshold: u32,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_host() -> String {
    "demo.ctraderapi.com".to_string()
}

fn default_port() -> u16 {
    5035
}

fn default_token_lifetime() -> u64 {
    2_628_000
}

fn default_request_timeout() -> f64 {
    15.0
}

fn default_auth_timeout() -> f64 {
    15.0
}

fn default_login_flow_timeout() -> f64 {
    300.0
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_reconnect_delay() -> f64 {
    3.0
}

fn default_reconnect_max_delay() -> f64 {
    60.0
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_jitter_ratio() -> f64 {
    0.15
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> f64 {
    10.0
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_watchdog_tick() -> f64 {
    10.0
}

fn default_grace_multiple() -> u32 {
    3
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_max_frame_len() -> usize {
    4 * 1024 * 1024
}

/// Timeout and retry settings for a single correlated request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestPolicy {
    pub timeout: Duration,
    /// Total sends, including the first.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RequestPolicy {
    pub fn single(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter_ratio: f64,
    pub max_attempts: u32,
    pub enabled: bool,
}

impl SessionConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut raw: toml::Value = toml::from_str(data).context("Failed to parse TOML config")?;
        let table = if let Some(table) = raw
            .get_mut("session")
            .and_then(|v| v.as_table_mut())
            .cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid session config structure"))?
        };
        let mut cfg: SessionConfig = toml::from_str(&toml::to_string(&table)?)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        override_string("CTRADER_HOST", &mut self.host);
        if let Ok(value) = env::var("CTRADER_PORT") {
            if let Ok(parsed) = value.parse::<u16>() {
                self.port = parsed;
            }
        }
        override_string("CTRADER_CLIENT_ID", &mut self.client_id);
        override_string("CTRADER_CLIENT_SECRET", &mut self.client_secret);
        override_string("CTRADER_ACCESS_TOKEN", &mut self.access_token);
        if let Ok(value) = env::var("CTRADER_REFRESH_TOKEN") {
            self.refresh_token = Some(value);
        }
        if let Ok(value) = env::var("CTRADER_ACCOUNT_ID") {
            if let Ok(parsed) = value.parse::<i64>() {
                self.account_id = parsed;
            }
        }
        override_f64("CTRADER_REQUEST_TIMEOUT", &mut self.request_timeout_secs);
        override_f64("CTRADER_OAUTH_TIMEOUT", &mut self.auth_timeout_secs);
        override_f64(
            "CTRADER_OAUTH_LOGIN_TIMEOUT",
            &mut self.login_flow_timeout_secs,
        );
        override_u32("CTRADER_RETRY_MAX_ATTEMPTS", &mut self.retry_max_attempts);
        override_f64(
            "CTRADER_RETRY_BACKOFF_SECONDS",
            &mut self.retry_backoff_secs,
        );
        override_f64("CTRADER_RECONNECT_DELAY", &mut self.reconnect_delay_secs);
        override_f64(
            "CTRADER_RECONNECT_MAX_DELAY",
            &mut self.reconnect_max_delay_secs,
        );
        override_u32(
            "CTRADER_RECONNECT_MAX_ATTEMPTS",
            &mut self.reconnect_max_attempts,
        );
        override_f64(
            "CTRADER_RECONNECT_JITTER_RATIO",
            &mut self.reconnect_jitter_ratio,
        );
        override_bool("CTRADER_AUTO_RECONNECT", &mut self.auto_reconnect);
        override_f64(
            "CTRADER_HEARTBEAT_INTERVAL",
            &mut self.heartbeat_interval_secs,
        );
        override_f64("CTRADER_WATCHDOG_TICK", &mut self.watchdog_tick_secs);
        override_u64("CTRADER_TOKEN_EXPIRES_IN", &mut self.token_expires_in_secs);
        override_u64(
            "CTRADER_TOKEN_REFRESH_MARGIN",
            &mut self.token_refresh_margin_secs,
        );
        override_u32(
            "CTRADER_WATCHDOG_MISS_THRESHOLD",
            &mut self.watchdog_miss_threshold,
        );
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.host.is_empty(), "host must not be empty");
        anyhow::ensure!(self.account_id > 0, "account_id must be positive");
        anyhow::ensure!(
            self.request_timeout_secs > 0.0,
            "request_timeout_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.auth_timeout_secs > 0.0,
            "auth_timeout_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.login_flow_timeout_secs >= self.auth_timeout_secs,
            "login_flow_timeout_secs must be >= auth_timeout_secs"
        );
        anyhow::ensure!(
            self.retry_backoff_secs >= 0.0,
            "retry_backoff_secs must be non-negative"
        );
        anyhow::ensure!(
            self.reconnect_delay_secs > 0.0
                && self.reconnect_max_delay_secs >= self.reconnect_delay_secs,
            "reconnect delays must satisfy 0 < delay <= max_delay"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.reconnect_jitter_ratio),
            "reconnect_jitter_ratio must be within [0, 1)"
        );
        anyhow::ensure!(
            self.heartbeat_interval_secs > 0.0,
            "heartbeat_interval_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.watchdog_tick_secs > 0.0,
            "watchdog_tick_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.watchdog_grace_multiple >= 1 && self.watchdog_miss_threshold >= 1,
            "watchdog grace multiple and miss threshold must be at least 1"
        );
        anyhow::ensure!(
            self.max_frame_len >= 1024,
            "max_frame_len must be at least 1024 bytes"
        );
        Ok(())
    }

    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            timeout: Duration::from_secs_f64(self.request_timeout_secs),
            max_attempts: self.retry_max_attempts.saturating_add(1),
            backoff: Duration::from_secs_f64(self.retry_backoff_secs),
        }
    }

    pub fn auth_policy(&self) -> RequestPolicy {
        RequestPolicy {
            timeout: Duration::from_secs_f64(self.auth_timeout_secs),
            ..self.request_policy()
        }
    }

    /// Orders and closes are sent exactly once.
    pub fn trading_policy(&self) -> RequestPolicy {
        RequestPolicy::single(Duration::from_secs_f64(self.request_timeout_secs))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_secs_f64(self.reconnect_delay_secs),
            max: Duration::from_secs_f64(self.reconnect_max_delay_secs),
            multiplier: 2.0,
            jitter_ratio: self.reconnect_jitter_ratio,
            max_attempts: self.reconnect_max_attempts,
            enabled: self.auto_reconnect,
        }
    }

    pub fn login_flow_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.login_flow_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_secs_f64(self.watchdog_tick_secs)
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_expires_in_secs)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

pub(crate) fn override_string(key: &str, field: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *field = value;
        }
    }
}

pub(crate) fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

pub(crate) fn override_u32(key: &str, field: &mut u32) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u32>() {
            *field = parsed;
        }
    }
}

pub(crate) fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

pub(crate) fn override_usize(key: &str, field: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<usize>() {
            *field = parsed;
        }
    }
}

pub(crate) fn override_bool(key: &str, field: &mut bool) {
    if let Ok(value) = env::var(key) {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "1" | "true" | "yes" | "on" => *field = true,
            "0" | "false" | "no" | "off" => *field = false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_table_with_defaults() {
        let cfg = SessionConfig::from_toml_str(
            r#"
            [session]
            account_id = 42
            retry_max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.account_id, 42);
        assert_eq!(cfg.port, 5035);
        assert_eq!(cfg.request_policy().max_attempts, 3);
        assert_eq!(cfg.trading_policy().max_attempts, 1);
        assert_eq!(cfg.reconnect_policy().initial, Duration::from_secs(3));
    }

    #[test]
    fn rejects_inverted_reconnect_delays() {
        let err = SessionConfig::from_toml_str(
            r#"
            account_id = 1
            reconnect_delay_secs = 10.0
            reconnect_max_delay_secs = 5.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reconnect delays"));
    }

    #[test]
    fn token_timing_follows_environment() {
        env::set_var("CTRADER_TOKEN_EXPIRES_IN", "3600");
        env::set_var("CTRADER_TOKEN_REFRESH_MARGIN", "120");
        let cfg = SessionConfig::from_toml_str("account_id = 5\n");
        env::remove_var("CTRADER_TOKEN_EXPIRES_IN");
        env::remove_var("CTRADER_TOKEN_REFRESH_MARGIN");
        let cfg = cfg.unwrap();
        assert_eq!(cfg.token_lifetime(), Duration::from_secs(3600));
        assert_eq!(cfg.token_refresh_margin(), Duration::from_secs(120));
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Upper bound for the refresh circuit's open window (one day).
pub const MAX_CIRCUIT_RESET_SECS: u64 = 86_400;

/// Configuration for the attend API client.
#[derive(Debug, Clone, clap::Args)]
pub struct ClientConfig {
    /// Base URL every request path is appended to.
    #[arg(long, default_value = "http://127.0.0.1:8080/api", env = "ATTEND_BASE_URL")]
    pub base_url: String,

    /// Session login endpoint.
    #[arg(long, default_value = "/auth/login", env = "ATTEND_LOGIN_PATH")]
    pub login_path: String,

    /// Session logout endpoint.
    #[arg(long, default_value = "/auth/logout", env = "ATTEND_LOGOUT_PATH")]
    pub logout_path: String,

    /// Token refresh endpoint.
    #[arg(long, default_value = "/auth/refresh", env = "ATTEND_REFRESH_PATH")]
    pub refresh_path: String,

    /// Identity check ("who am I") endpoint.
    #[arg(long, default_value = "/auth/me", env = "ATTEND_ME_PATH")]
    pub me_path: String,

    /// Per-request transport timeout in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "ATTEND_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Timeout for a single refresh call in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "ATTEND_REFRESH_TIMEOUT_MS")]
    pub refresh_timeout_ms: u64,

    /// Known access token lifetime in seconds.
    #[arg(long, default_value_t = 900, env = "ATTEND_TOKEN_LIFETIME_SECS")]
    pub token_lifetime_secs: u64,

    /// How long before expiry the proactive refresh fires, in seconds.
    #[arg(long, default_value_t = 120, env = "ATTEND_REFRESH_LEAD_SECS")]
    pub refresh_lead_secs: u64,

    /// Max callers parked behind an in-flight refresh.
    #[arg(long, default_value_t = 50, env = "ATTEND_MAX_WAITERS")]
    pub max_waiters: usize,

    /// How long a parked caller waits for the in-flight refresh, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "ATTEND_WAITER_TIMEOUT_MS")]
    pub waiter_timeout_ms: u64,

    /// Delay between consecutive waiter releases after a refresh, in milliseconds.
    #[arg(long, default_value_t = 50, env = "ATTEND_RELEASE_STAGGER_MS")]
    pub release_stagger_ms: u64,

    /// Consecutive refresh failures that open the circuit.
    #[arg(long, default_value_t = 3, env = "ATTEND_CIRCUIT_THRESHOLD")]
    pub circuit_threshold: u32,

    /// How long the circuit stays open, in seconds.
    #[arg(long, default_value_t = 30, env = "ATTEND_CIRCUIT_RESET_SECS")]
    pub circuit_reset_secs: u64,

    /// Max automatic retries of an idempotent request answered with 429.
    #[arg(long, default_value_t = 3, env = "ATTEND_MAX_RATE_LIMIT_RETRIES")]
    pub max_rate_limit_retries: u32,

    /// First 429 backoff step in milliseconds (doubles per attempt).
    #[arg(long, default_value_t = 1_000, env = "ATTEND_BACKOFF_BASE_MS")]
    pub backoff_base_ms: u64,

    /// Upper bound for a 429 backoff step in milliseconds.
    #[arg(long, default_value_t = 8_000, env = "ATTEND_BACKOFF_MAX_MS")]
    pub backoff_max_ms: u64,

    /// Longest Retry-After wait honoured before the 429 is surfaced, in seconds.
    #[arg(long, default_value_t = 60, env = "ATTEND_MAX_RETRY_AFTER_SECS")]
    pub max_retry_after_secs: u64,

    /// Proactive re-check delay while another refresh is in flight, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "ATTEND_BUSY_RECHECK_MS")]
    pub busy_recheck_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_owned(),
            login_path: "/auth/login".to_owned(),
            logout_path: "/auth/logout".to_owned(),
            refresh_path: "/auth/refresh".to_owned(),
            me_path: "/auth/me".to_owned(),
            request_timeout_ms: 30_000,
            refresh_timeout_ms: 5_000,
            token_lifetime_secs: 900,
            refresh_lead_secs: 120,
            max_waiters: 50,
            waiter_timeout_ms: 10_000,
            release_stagger_ms: 50,
            circuit_threshold: 3,
            circuit_reset_secs: 30,
            max_rate_limit_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 8_000,
            max_retry_after_secs: 60,
            busy_recheck_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Convenience constructor for a backend at `base_url` with default tuning.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Self::default() }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| anyhow::anyhow!("invalid --base-url {:?}: {e}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("--base-url must be http or https, got {}", url.scheme());
        }

        for (flag, path) in [
            ("--login-path", &self.login_path),
            ("--logout-path", &self.logout_path),
            ("--refresh-path", &self.refresh_path),
            ("--me-path", &self.me_path),
        ] {
            if !path.starts_with('/') {
                anyhow::bail!("{flag} must start with '/', got {path:?}");
            }
        }

        if self.refresh_lead_secs >= self.token_lifetime_secs {
            anyhow::bail!("--refresh-lead-secs must be shorter than --token-lifetime-secs");
        }
        if self.max_waiters == 0 {
            anyhow::bail!("--max-waiters must be at least 1");
        }
        if self.circuit_threshold == 0 {
            anyhow::bail!("--circuit-threshold must be at least 1");
        }
        if self.release_stagger_ms >= self.waiter_timeout_ms {
            anyhow::bail!("--release-stagger-ms must be shorter than --waiter-timeout-ms");
        }
        if self.circuit_reset_secs > MAX_CIRCUIT_RESET_SECS {
            anyhow::bail!("--circuit-reset-secs cannot exceed {MAX_CIRCUIT_RESET_SECS}");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            anyhow::bail!("--backoff-base-ms cannot exceed --backoff-max-ms");
        }

        Ok(())
    }

    /// Join `path` onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn waiter_timeout(&self) -> Duration {
        Duration::from_millis(self.waiter_timeout_ms)
    }

    pub fn release_stagger(&self) -> Duration {
        Duration::from_millis(self.release_stagger_ms)
    }

    pub fn circuit_reset(&self) -> Duration {
        Duration::from_secs(self.circuit_reset_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }

    pub fn busy_recheck(&self) -> Duration {
        Duration::from_millis(self.busy_recheck_ms)
    }

    /// Delay from a successful session response to the proactive refresh.
    pub fn proactive_delay(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs.saturating_sub(self.refresh_lead_secs))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

//! Lifecycle configuration.
//!
//! Defaults mirror the production admin panel. The auto-refresh period, the
//! staleness threshold and the idle timeout are independent values; nothing
//! here derives one from another.
//!
//! Every value can be overridden from the environment (`SWEAT24_*`).

use std::time::Duration;

use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/v1";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws";

/// Paths of the backend endpoint roles, relative to `api_base_url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub login: String,
    pub logout: String,
    pub refresh: String,
    pub identity: String,
    pub unread_count: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".into(),
            logout: "/auth/logout".into(),
            refresh: "/auth/refresh".into(),
            identity: "/auth/me".into(),
            unread_count: "/chat/unread-count".into(),
        }
    }
}

/// Idle-session guard timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Inactivity after which the session is force-closed
    pub session_duration: Duration,
    /// How long before `session_duration` the warning fires
    pub warning_window: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            session_duration: Duration::from_secs(20 * 60),
            warning_window: Duration::from_secs(2 * 60),
        }
    }
}

impl WatchdogConfig {
    /// Delay from the last activity signal to the warning.
    pub fn warning_after(&self) -> Duration {
        self.session_duration.saturating_sub(self.warning_window)
    }
}

/// Realtime socket retry and fallback policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl RealtimeConfig {
    /// Backoff before reconnect attempt `attempt` (0-based):
    /// `min(base_delay * 2^attempt, max_delay)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Everything the lifecycle layer needs to know about its environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub api_base_url: String,
    pub ws_url: String,
    pub endpoints: Endpoints,
    pub request_timeout: Duration,
    /// Period of the unconditional background refresh
    pub auto_refresh_interval: Duration,
    /// Persisted snapshots older than this are refreshed instead of verified
    pub stale_after: Duration,
    pub watchdog: WatchdogConfig,
    pub realtime: RealtimeConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.into(),
            ws_url: DEFAULT_WS_URL.into(),
            endpoints: Endpoints::default(),
            request_timeout: Duration::from_secs(30),
            auto_refresh_interval: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(24 * 60 * 60),
            watchdog: WatchdogConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `SWEAT24_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are logged and ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = non_empty(lookup("SWEAT24_API_URL")) {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = non_empty(lookup("SWEAT24_WS_URL")) {
            self.ws_url = url;
        }

        let secs = |key: &str| parse_secs(key, lookup(key));
        if let Some(d) = secs("SWEAT24_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = d;
        }
        if let Some(d) = secs("SWEAT24_AUTO_REFRESH_SECS") {
            self.auto_refresh_interval = d;
        }
        if let Some(d) = secs("SWEAT24_STALE_AFTER_SECS") {
            self.stale_after = d;
        }
        if let Some(d) = secs("SWEAT24_IDLE_TIMEOUT_SECS") {
            self.watchdog.session_duration = d;
        }
        if let Some(d) = secs("SWEAT24_IDLE_WARNING_SECS") {
            self.watchdog.warning_window = d;
        }
        if let Some(d) = secs("SWEAT24_POLL_INTERVAL_SECS") {
            self.realtime.poll_interval = d;
        }
        if let Some(raw) = non_empty(lookup("SWEAT24_MAX_RECONNECT_ATTEMPTS")) {
            match raw.trim().parse() {
                Ok(n) => self.realtime.max_reconnect_attempts = n,
                Err(_) => warn!(
                    component = "config",
                    event = "config.invalid_value",
                    key = "SWEAT24_MAX_RECONNECT_ATTEMPTS",
                    value = %raw,
                    "Ignoring invalid config value"
                ),
            }
        }
        self
    }

    /// Absolute URL for an endpoint path.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_secs(key: &str, value: Option<String>) -> Option<Duration> {
    let raw = non_empty(value)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.invalid_value",
                key,
                value = %raw,
                "Ignoring invalid config value"
            );
            None
        }
    }
}

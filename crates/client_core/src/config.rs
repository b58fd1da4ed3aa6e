use std::{fs, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{error::SyncError, retry::ReconnectPolicy};

/// Operational knobs for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the chat backend, e.g. `https://chat.example.org`.
    pub server_url: String,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// How long an outgoing message may wait for its ack before it is marked
    /// failed.
    pub ack_timeout: Duration,
    /// Idle window after the last keystroke before `stop_typing` goes out.
    pub typing_idle_window: Duration,
    pub history_page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            reconnect_max_attempts: 10,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            typing_idle_window: Duration::from_secs(2),
            history_page_size: 50,
        }
    }
}

impl SyncConfig {
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_max_attempts,
            self.reconnect_base_delay,
            self.reconnect_max_delay,
        )
    }

    /// Derive the websocket endpoint from the HTTP base URL.
    pub fn ws_url(&self) -> Result<String, SyncError> {
        let parsed = Url::parse(&self.server_url)
            .map_err(|e| SyncError::Config(format!("invalid server_url: {e}")))?;
        let scheme = match parsed.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(SyncError::Config(format!(
                    "server_url must be http(s), got '{other}'"
                )))
            }
        };
        let rest = self
            .server_url
            .splitn(2, "://")
            .nth(1)
            .unwrap_or_default()
            .trim_end_matches('/');
        Ok(format!("{scheme}://{rest}/ws"))
    }
}

/// Partial settings from `sync.toml` or the environment; unset fields keep
/// their previous value.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    server_url: Option<String>,
    reconnect_max_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
    history_page_size: Option<u32>,
}

impl ConfigOverrides {
    fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        Self {
            server_url: std::env::var("SYNC_SERVER_URL").ok(),
            reconnect_max_attempts: parsed("SYNC_RECONNECT_MAX_ATTEMPTS"),
            reconnect_base_delay_ms: parsed("SYNC_RECONNECT_BASE_DELAY_MS"),
            ack_timeout_ms: parsed("SYNC_ACK_TIMEOUT_MS"),
            typing_idle_ms: parsed("SYNC_TYPING_IDLE_MS"),
            history_page_size: parsed("SYNC_HISTORY_PAGE_SIZE"),
        }
    }

    fn apply(self, config: &mut SyncConfig) {
        if let Some(v) = self.server_url {
            config.server_url = v;
        }
        if let Some(v) = self.reconnect_max_attempts {
            config.reconnect_max_attempts = v;
        }
        if let Some(v) = self.reconnect_base_delay_ms {
            config.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.typing_idle_ms {
            config.typing_idle_window = Duration::from_millis(v);
        }
        if let Some(v) = self.history_page_size {
            config.history_page_size = v;
        }
    }
}

/// Build a config from defaults, an optional `sync.toml`, and environment
/// overrides, in that precedence order.
pub fn load_config() -> SyncConfig {
    let mut config = SyncConfig::default();

    if let Ok(raw) = fs::read_to_string("sync.toml") {
        match toml::from_str::<ConfigOverrides>(&raw) {
            Ok(overrides) => overrides.apply(&mut config),
            Err(err) => warn!(error = %err, "ignoring malformed sync.toml"),
        }
    }

    ConfigOverrides::from_env().apply(&mut config);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_scheme_from_http_base() {
        let http = SyncConfig::with_server_url("http://chat.example.org:8443");
        assert_eq!(
            http.ws_url().expect("ws url"),
            "ws://chat.example.org:8443/ws"
        );

        let https = SyncConfig::with_server_url("https://chat.example.org/");
        assert_eq!(
            https.ws_url().expect("wss url"),
            "wss://chat.example.org/ws"
        );
    }

    #[test]
    fn rejects_non_http_server_urls() {
        let cfg = SyncConfig::with_server_url("ftp://chat.example.org");
        assert!(matches!(cfg.ws_url(), Err(SyncError::Config(_))));
    }

    #[test]
    fn file_overrides_apply_over_defaults() {
        let mut config = SyncConfig::default();
        let overrides: ConfigOverrides = toml::from_str(
            r#"
            server_url = "https://override.example.org"
            ack_timeout_ms = 2500
            history_page_size = 25
            "#,
        )
        .expect("parse overrides");
        overrides.apply(&mut config);

        assert_eq!(config.server_url, "https://override.example.org");
        assert_eq!(config.ack_timeout, Duration::from_millis(2500));
        assert_eq!(config.history_page_size, 25);
        // untouched fields keep their defaults
        assert_eq!(config.reconnect_max_attempts, 10);
    }

    #[test]
    fn unknown_keys_in_the_config_file_are_tolerated() {
        let overrides: Result<ConfigOverrides, _> =
            toml::from_str("unrelated_key = \"value\"\nack_timeout_ms = 100");
        let overrides = overrides.expect("unknown keys must not break parsing");
        assert_eq!(overrides.ack_timeout_ms, Some(100));
    }
}

//! Streaming transport configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Default endpoint path appended to the server URL
pub const DEFAULT_STREAM_PATH: &str = "/stream";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Server base URL (http, https, ws or wss)
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Bearer token sent on the upgrade request
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    /// Messages held while not connected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// First reconnect delay, doubled on every further attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Seconds between pings while connected (0 disables)
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest a single socket write may stay pending before the link is
    /// treated as dead
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_key: None,
            path: default_path(),
            queue_capacity: default_queue_capacity(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl TransportConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    /// Socket URL for a session
    pub fn stream_url(&self, session_id: &str) -> Result<String, TransportError> {
        stream_url(&self.server_url, &self.path, session_id)
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Build `{ws_base}{path}?session={id}`, upgrading http to ws and https to wss
pub fn stream_url(server_url: &str, path: &str, session_id: &str) -> Result<String, TransportError> {
    let trimmed = server_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("wss://") || trimmed.starts_with("ws://") {
        trimmed.to_string()
    } else {
        return Err(TransportError::InvalidUrl(server_url.to_string()));
    };

    let host = base.split_once("://").map_or("", |(_, host)| host);
    if host.is_empty() {
        return Err(TransportError::InvalidUrl(server_url.to_string()));
    }

    let path = if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    Ok(format!("{base}{path}?session={}", encode_query_value(session_id)))
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.path, "/stream");
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay(), Duration::from_secs(1));
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TransportConfig =
            toml::from_str("server_url = \"https://mesh.example.com\"\nkeepalive_interval_secs = 0\n")
                .unwrap();
        assert_eq!(config.server_url, "https://mesh.example.com");
        assert_eq!(config.keepalive_interval(), None);
        assert_eq!(config.connect_timeout_secs, 10);
    }

    #[test]
    fn test_stream_url_upgrades_scheme() {
        assert_eq!(
            stream_url("https://mesh.example.com/", "/stream", "abc").unwrap(),
            "wss://mesh.example.com/stream?session=abc"
        );
        assert_eq!(
            stream_url("http://localhost:8080", "stream", "abc").unwrap(),
            "ws://localhost:8080/stream?session=abc"
        );
        assert_eq!(
            stream_url("wss://mesh.example.com", "/stream", "abc").unwrap(),
            "wss://mesh.example.com/stream?session=abc"
        );
    }

    #[test]
    fn test_stream_url_encodes_session() {
        assert_eq!(
            stream_url("ws://h", "/stream", "a b&c").unwrap(),
            "ws://h/stream?session=a%20b%26c"
        );
    }

    #[test]
    fn test_stream_url_rejects_bad_urls() {
        assert!(matches!(
            stream_url("ftp://mesh.example.com", "/stream", "s"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(stream_url("mesh.example.com", "/stream", "s").is_err());
        assert!(stream_url("https://", "/stream", "s").is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(1000);
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| backoff_delay(base, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(backoff_delay(base, 0), base);
        assert!(backoff_delay(base, 64) >= backoff_delay(base, 32));
    }
}

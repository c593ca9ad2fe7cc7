use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the webhook transports and session timers.
///
/// Every knob has a default; [`Config::from_env`] overlays the recognized
/// environment variables on top of those defaults, so a missing variable
/// always means "use the default".
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Keep-alive connection pooling for webhook HTTP clients (`HTTP_POOL`,
    /// `0` disables).
    pub http_pool: bool,
    /// Max idle connections kept per origin (`HTTP_POOLSIZE`).
    pub http_poolsize: usize,
    /// Pipelining depth hint per pooled connection (`HTTP_PIPELINING`).
    pub http_pipelining: usize,
    /// Total request timeout in milliseconds (`HTTP_TIMEOUT`).
    pub http_timeout_ms: u64,
    /// Outbound proxy (`HTTP_PROXY_IP` / `HTTP_PROXY_PORT` /
    /// `HTTP_PROXY_PROTOCOL`).
    pub http_proxy_ip: Option<String>,
    pub http_proxy_port: Option<u16>,
    pub http_proxy_protocol: String,
    /// Value for the outbound `user-agent` header (`HTTP_USER_AGENT_HEADER`).
    pub http_user_agent: Option<String>,
    /// How long to wait for an ack to an ack-expecting WebSocket message
    /// (`RESPONSE_TIMEOUT_MS`).
    pub response_timeout_ms: u64,
    /// WebSocket ping interval (`JAMBONES_WS_PING_INTERVAL_MS`); pings are
    /// only sent when this exceeds 15000.
    pub ws_ping_interval_ms: u64,
    /// Total successful connections allowed per WebSocket requestor,
    /// initial connect included (`MAX_RECONNECTS`).
    pub max_reconnects: u32,
    /// WebSocket upgrade handshake timeout
    /// (`JAMBONES_WS_HANDSHAKE_TIMEOUT_MS`).
    pub ws_handshake_timeout_ms: u64,
    /// Largest accepted inbound WebSocket frame in bytes
    /// (`JAMBONES_WS_MAX_PAYLOAD`).
    pub ws_max_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_pool: true,
            http_poolsize: 10,
            http_pipelining: 1,
            http_timeout_ms: 10_000,
            http_proxy_ip: None,
            http_proxy_port: None,
            http_proxy_protocol: "http".to_string(),
            http_user_agent: None,
            response_timeout_ms: 5_000,
            ws_ping_interval_ms: 0,
            max_reconnects: 5,
            ws_handshake_timeout_ms: 1_500,
            ws_max_payload: 24 * 1024,
        }
    }
}

fn env_var<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(v) = env_var::<u8>("HTTP_POOL") {
            cfg.http_pool = v != 0;
        }
        if let Some(v) = env_var("HTTP_POOLSIZE") {
            cfg.http_poolsize = v;
        }
        if let Some(v) = env_var("HTTP_PIPELINING") {
            cfg.http_pipelining = v;
        }
        if let Some(v) = env_var("HTTP_TIMEOUT") {
            cfg.http_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("HTTP_PROXY_IP") {
            if !v.is_empty() {
                cfg.http_proxy_ip = Some(v);
            }
        }
        if let Some(v) = env_var("HTTP_PROXY_PORT") {
            cfg.http_proxy_port = Some(v);
        }
        if let Ok(v) = std::env::var("HTTP_PROXY_PROTOCOL") {
            if !v.is_empty() {
                cfg.http_proxy_protocol = v;
            }
        }
        if let Ok(v) = std::env::var("HTTP_USER_AGENT_HEADER") {
            if !v.is_empty() {
                cfg.http_user_agent = Some(v);
            }
        }
        if let Some(v) = env_var("RESPONSE_TIMEOUT_MS") {
            cfg.response_timeout_ms = v;
        }
        if let Some(v) = env_var("JAMBONES_WS_PING_INTERVAL_MS") {
            cfg.ws_ping_interval_ms = v;
        }
        if let Some(v) = env_var("MAX_RECONNECTS") {
            cfg.max_reconnects = v;
        }
        if let Some(v) = env_var("JAMBONES_WS_HANDSHAKE_TIMEOUT_MS") {
            cfg.ws_handshake_timeout_ms = v;
        }
        if let Some(v) = env_var("JAMBONES_WS_MAX_PAYLOAD") {
            cfg.ws_max_payload = v;
        }
        cfg
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ws_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_handshake_timeout_ms)
    }

    /// Proxy URL when at least an ip is configured.
    pub fn proxy_url(&self) -> Option<String> {
        match (&self.http_proxy_ip, self.http_proxy_port) {
            (Some(ip), Some(port)) => {
                Some(format!("{}://{}:{}", self.http_proxy_protocol, ip, port))
            }
            (Some(ip), None) => Some(format!("{}://{}", self.http_proxy_protocol, ip)),
            _ => None,
        }
    }

    /// Ping keepalive is only armed above a 15 second floor.
    pub fn ws_ping_interval(&self) -> Option<Duration> {
        if self.ws_ping_interval_ms > 15_000 {
            Some(Duration::from_millis(self.ws_ping_interval_ms))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.http_pool);
        assert_eq!(cfg.ws_handshake_timeout_ms, 1_500);
        assert_eq!(cfg.ws_max_payload, 24 * 1024);
        assert_eq!(cfg.max_reconnects, 5);
        assert!(cfg.proxy_url().is_none());
        assert!(cfg.ws_ping_interval().is_none());
    }

    #[test]
    fn test_ping_interval_floor() {
        let cfg = Config {
            ws_ping_interval_ms: 15_000,
            ..Default::default()
        };
        assert!(cfg.ws_ping_interval().is_none());
        let cfg = Config {
            ws_ping_interval_ms: 20_000,
            ..Default::default()
        };
        assert_eq!(cfg.ws_ping_interval(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_proxy_url() {
        let cfg = Config {
            http_proxy_ip: Some("10.0.0.1".into()),
            http_proxy_port: Some(3128),
            ..Default::default()
        };
        assert_eq!(cfg.proxy_url().as_deref(), Some("http://10.0.0.1:3128"));
    }
}

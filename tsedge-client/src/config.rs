//! Connection configuration.
//!
//! Plain data consumed by [`EdgeConnection`](crate::EdgeConnection); the demo
//! binary maps its CLI flags onto it.

use std::time::Duration;

// ---

use tsedge_domain::{Result, TsEdgeError};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_NAME: &str = "Connection1";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// ConnectionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    // ---
    /// Tag carried on every log record of this connection.
    pub name: String,

    /// `scheme://host[:port][/path]` or bare `host`. `https` enables TLS.
    pub server_url: String,

    /// Local node identity. Falls back to the token source's client id.
    pub node_id: Option<String>,

    pub project_id: Option<String>,

    /// Connect timeout; also the transport's ping interval and ping timeout.
    pub connect_timeout: Duration,

    /// Timeout for channel open/close and metadata sends. Zero disables it.
    pub response_timeout: Duration,

    pub log_sent_data_points: bool,
    pub log_received_data_points: bool,
}

// ---

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            server_url: String::new(),
            node_id: None,
            project_id: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            log_sent_data_points: false,
            log_received_data_points: false,
        }
    }
}

// ---

impl ConnectionConfig {
    // ---
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_data_point_logging(mut self, sent: bool, received: bool) -> Self {
        self.log_sent_data_points = sent;
        self.log_received_data_points = received;
        self
    }

    // ---

    pub fn validate(&self) -> Result<()> {
        // ---
        if self.server_url.trim().is_empty() {
            return Err(TsEdgeError::InvalidEndpoint("server url is empty".into()));
        }
        Ok(())
    }

    /// `None` when the response timeout is disabled.
    pub fn response_timeout(&self) -> Option<Duration> {
        (!self.response_timeout.is_zero()).then_some(self.response_timeout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults() {
        // ---
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.name, "Connection1");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(60));
        assert_eq!(cfg.response_timeout(), Some(Duration::from_secs(120)));
        assert!(!cfg.log_sent_data_points);
    }

    #[test]
    fn zero_response_timeout_means_none() {
        // ---
        let cfg = ConnectionConfig::new("h").with_response_timeout(Duration::ZERO);
        assert_eq!(cfg.response_timeout(), None);
    }

    #[test]
    fn empty_url_is_rejected() {
        // ---
        assert!(matches!(
            ConnectionConfig::new("  ").validate(),
            Err(TsEdgeError::InvalidEndpoint(_))
        ));
        assert!(ConnectionConfig::new("https://edge.example").validate().is_ok());
    }
}

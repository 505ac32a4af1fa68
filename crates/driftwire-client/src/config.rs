//! Client configuration.

use std::time::Duration;

use crate::error::ClientError;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Connection options for [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, `ws[s]://host[:port]/websocket`.
    pub endpoint: String,

    /// Accept endpoints that do not look like DDP URLs.
    pub suppress_url_errors: bool,

    /// Probe URL handed to the reachability implementation, when one
    /// is bound.
    pub reachability_url: Option<String>,

    /// Open the socket as soon as the runtime starts.
    pub auto_connect: bool,

    /// Re-open the socket after it drops.
    pub auto_reconnect: bool,

    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,

    /// Strip field values from verbose frame logs.
    pub private: bool,

    /// Log every inbound and outbound frame.
    pub verbose: bool,
}

impl ClientConfig {
    /// Options for `endpoint` with every default.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            suppress_url_errors: false,
            reachability_url: None,
            auto_connect: true,
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            private: true,
            verbose: false,
        }
    }

    /// Check the endpoint shape unless `suppress_url_errors` is set.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.suppress_url_errors {
            return Ok(());
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ClientError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "must start with ws:// or wss://",
            });
        }
        if !self.endpoint.ends_with("/websocket") {
            return Err(ClientError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "must end with /websocket",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_endpoints() {
        assert!(ClientConfig::new("ws://localhost:3000/websocket").validate().is_ok());
        assert!(ClientConfig::new("wss://app.example.com/websocket").validate().is_ok());
    }

    #[test]
    fn rejects_http_and_bare_paths() {
        assert!(ClientConfig::new("http://localhost/websocket").validate().is_err());
        assert!(ClientConfig::new("ws://localhost:3000/sockjs").validate().is_err());
    }

    #[test]
    fn suppression_skips_validation() {
        let mut config = ClientConfig::new("http://weird-proxy");
        config.suppress_url_errors = true;
        assert!(config.validate().is_ok());
    }
}

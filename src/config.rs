//! Listener configuration.
//!
//! Everything the core needs flows in through `ListenerConfig`; nothing is read
//! from the environment. The connector and dispatcher take narrower views
//! derived from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::ReplayFrom;

/// Production login host.
pub const LOGIN_URL: &str = "https://login.salesforce.com";

/// Sandbox login host.
pub const SANDBOX_LOGIN_URL: &str = "https://test.salesforce.com";

/// Default API version used for both login and the streaming endpoint.
pub const DEFAULT_API_VERSION: &str = "59.0";

/// Configuration for a `Listener`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Cursor used for channels that have no processed events yet.
    pub replay_from: i64,
    /// Log in against the sandbox host.
    pub sandbox: bool,
    /// API version, e.g. "59.0".
    pub api_version: String,
    /// Overrides the login host derived from `sandbox`.
    pub login_url: Option<String>,
    /// Max wait for a handshake acknowledgement.
    pub handshake_timeout_ms: u64,
    /// Max wait for a subscribe acknowledgement.
    pub subscribe_timeout_ms: u64,
    /// HTTP request timeout. Must exceed the server's long-poll hold time.
    pub http_timeout_ms: u64,
    /// Max queued events between the transport and the dispatcher worker.
    pub dispatch_queue_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            replay_from: ReplayFrom::LATEST.raw(),
            sandbox: false,
            api_version: DEFAULT_API_VERSION.to_string(),
            login_url: None,
            handshake_timeout_ms: 5_000,
            subscribe_timeout_ms: 5_000,
            http_timeout_ms: 120_000,
            dispatch_queue_capacity: 1024,
        }
    }
}

impl ListenerConfig {
    /// Config with the given initial cursor and sandbox flag.
    #[must_use]
    pub fn new(replay_from: i64, sandbox: bool) -> Self {
        Self {
            replay_from,
            sandbox,
            ..Self::default()
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ReplayFrom::try_from_raw(self.replay_from)?;
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::Empty { field: "api_version" });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "handshake_timeout_ms",
            });
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "subscribe_timeout_ms",
            });
        }
        if self.http_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "http_timeout_ms" });
        }
        if self.dispatch_queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "dispatch_queue_capacity",
            });
        }
        if matches!(&self.login_url, Some(url) if url.trim().is_empty()) {
            return Err(ConfigError::Empty { field: "login_url" });
        }
        Ok(())
    }

    /// Login host, honoring the override and the sandbox flag.
    #[must_use]
    pub fn login_url(&self) -> &str {
        match &self.login_url {
            Some(url) => url.trim_end_matches('/'),
            None if self.sandbox => SANDBOX_LOGIN_URL,
            None => LOGIN_URL,
        }
    }

    /// Initial cursor for channels without processed events.
    #[must_use]
    pub fn default_replay_from(&self) -> ReplayFrom {
        ReplayFrom::new(self.replay_from)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    #[must_use]
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            subscribe_timeout: Duration::from_millis(self.subscribe_timeout_ms),
        }
    }

    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.dispatch_queue_capacity,
        }
    }
}

/// Protocol timeouts for `StreamingConnector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub handshake_timeout: Duration,
    pub subscribe_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(5),
        }
    }
}

/// Queue sizing for `EventDispatcher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Max queued events before `submit` blocks.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

//! Configuration structs with setter methods, rather than an external
//! builder-derive crate.

use std::time::Duration;

/// Golden ratio, the reconnect backoff growth factor.
pub const GOLDEN_RATIO: f64 = 1.6180339887498948;

/// Configuration for a [`crate::RemoteObject`] proxy.
#[derive(Clone, Debug)]
pub struct RemoteObjectConfig {
    pub(crate) retry_on_reconnect: bool,
    pub(crate) timeout: Option<Duration>,
}

impl Default for RemoteObjectConfig {
    fn default() -> Self {
        Self {
            retry_on_reconnect: false,
            timeout: None,
        }
    }
}

impl RemoteObjectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// If `true`, re-issue calls that failed due to connection loss once a
    /// new connection is available. Default `false`.
    pub fn retry_on_reconnect(mut self, retry: bool) -> Self {
        self.retry_on_reconnect = retry;
        self
    }

    /// Overall timeout across any number of reconnect retries. Default: none.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Configuration for a [`crate::ClientProtocol`].
#[derive(Clone, Debug)]
pub struct ClientProtocolConfig {
    pub(crate) deferred_response_timeout: Duration,
}

impl Default for ClientProtocolConfig {
    fn default() -> Self {
        Self {
            deferred_response_timeout: Duration::from_secs(60),
        }
    }
}

impl ClientProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout for a single deferred `MethodCall` response. Default 60s.
    pub fn deferred_response_timeout(mut self, timeout: Duration) -> Self {
        self.deferred_response_timeout = timeout;
        self
    }
}

/// Configuration for a [`crate::ReconnectingClientFactory`].
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub(crate) max_retries: Option<u32>,
    pub(crate) factor: f64,
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            factor: GOLDEN_RATIO,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl ReconnectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up and notify a give-up event once `retries > max_retries`.
    /// Default: retry forever.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

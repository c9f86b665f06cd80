//! Endpoints, session modes, and timing configuration.

use std::fmt;
use std::time::Duration;

use crate::error::XapiError;

/// Demo account command endpoint.
pub const DEMO_ENDPOINT: &str = "wss://ws.xtb.com/demo";
/// Demo account streaming endpoint.
pub const DEMO_STREAM_ENDPOINT: &str = "wss://ws.xtb.com/demoStream";
/// Real account command endpoint.
pub const REAL_ENDPOINT: &str = "wss://ws.xtb.com/real";
/// Real account streaming endpoint.
pub const REAL_STREAM_ENDPOINT: &str = "wss://ws.xtb.com/realStream";

/// Account environment the endpoints are chosen for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccountType {
    Demo,
    Real,
}

/// Operating mode of a session. Fixed at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SessionMode {
    /// Correlated request/response commands.
    Command,
    /// Subscriptions and push events bound to a stream session id.
    Streaming,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::Streaming => f.write_str("streaming"),
        }
    }
}

/// Returns the service endpoint for an account type and session mode.
pub fn endpoint_for(account: AccountType, mode: SessionMode) -> &'static str {
    match (account, mode) {
        (AccountType::Demo, SessionMode::Command) => DEMO_ENDPOINT,
        (AccountType::Demo, SessionMode::Streaming) => DEMO_STREAM_ENDPOINT,
        (AccountType::Real, SessionMode::Command) => REAL_ENDPOINT,
        (AccountType::Real, SessionMode::Streaming) => REAL_STREAM_ENDPOINT,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    /// Minimum spacing between two outbound frames (service rate limit).
    pub const SEND_INTERVAL: Duration = Duration::from_millis(250);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(10_000);
    pub const CALL_TIMEOUT: Duration = Duration::from_millis(5_000);
}

/// Timing configuration applied to a session at construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    /// Minimum time between two dequeues of the send governor.
    pub send_interval: Duration,
    /// Period of the liveness loop. The first ping goes out immediately.
    pub keepalive_interval: Duration,
    /// Default deadline for correlated calls.
    pub call_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_interval: SessionDefaults::SEND_INTERVAL,
            keepalive_interval: SessionDefaults::KEEPALIVE_INTERVAL,
            call_timeout: SessionDefaults::CALL_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Rejects values the engine cannot run with.
    ///
    /// A zero send interval is allowed and disables spacing; a zero keepalive
    /// period or call timeout is not.
    pub fn validate(&self) -> Result<(), XapiError> {
        if self.keepalive_interval.is_zero() {
            return Err(XapiError::Config(
                "keepalive_interval must be > 0".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(XapiError::Config("call_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

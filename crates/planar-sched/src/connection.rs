//! Connection establishment with bounded retry.
//!
//! A freshly started cluster node may take a while before it accepts SSH.
//! [`ConnectionManager`] retries transient failures on a fixed delay and gives
//! up after a bounded number of attempts, while wrong credentials abort at
//! once.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DispatchError, DispatchResult};
use crate::remote::RemoteSession;

/// Default number of connection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Where and as whom to connect.
#[derive(Clone)]
pub struct HostTarget {
    /// Hostname or IP address.
    pub host: String,

    /// SSH port.
    pub port: u16,

    /// Login name.
    pub username: String,

    /// Login password.
    pub password: String,
}

impl HostTarget {
    /// Create a target on the default SSH port.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Why a single connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Credentials were rejected. Never retried.
    Auth(String),

    /// The host presented a key that contradicts the known-hosts record.
    HostKey(String),

    /// The host could not be reached or the handshake failed.
    Transient(String),
}

/// Opens sessions to a remote host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced on success.
    type Session: RemoteSession;

    /// Make a single connection attempt.
    async fn open(&self, target: &HostTarget) -> Result<Self::Session, ConnectFailure>;
}

/// Retry policy for connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,

    /// Delay after each transient failure.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// States of the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectState {
    /// About to make the given (1-based) attempt.
    Connecting { attempt: u32 },

    /// The last attempt failed transiently; `failures` so far.
    TransientFailure { failures: u32 },

    /// Credentials were rejected.
    AuthFailed,

    /// The stored host key does not match.
    HostKeyRejected,

    /// A session is open.
    Connected,

    /// The retry budget is exhausted.
    GaveUp { attempts: u32 },
}

impl ConnectState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectState::AuthFailed
                | ConnectState::HostKeyRejected
                | ConnectState::Connected
                | ConnectState::GaveUp { .. }
        )
    }

    /// Next state after an attempt outcome, under `policy`.
    pub fn on_failure(&self, failure: &ConnectFailure, policy: &RetryPolicy) -> ConnectState {
        let attempt = match self {
            ConnectState::Connecting { attempt } => *attempt,
            other => return other.clone(),
        };
        match failure {
            ConnectFailure::Auth(_) => ConnectState::AuthFailed,
            ConnectFailure::HostKey(_) => ConnectState::HostKeyRejected,
            ConnectFailure::Transient(_) if attempt >= policy.max_attempts => {
                ConnectState::GaveUp { attempts: attempt }
            }
            ConnectFailure::Transient(_) => ConnectState::TransientFailure { failures: attempt },
        }
    }
}

/// Establishes the single session used by a dispatch run.
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    policy: RetryPolicy,
}

impl ConnectionManager {
    /// Create a manager with the given retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Get the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connect to `target`, retrying transient failures.
    pub async fn connect<C: Connector>(
        &self,
        connector: &C,
        target: &HostTarget,
    ) -> DispatchResult<C::Session> {
        let mut state = ConnectState::Connecting { attempt: 1 };

        loop {
            let ConnectState::Connecting { attempt } = state else {
                return Err(DispatchError::Internal(format!(
                    "connection state machine stalled in {state:?}"
                )));
            };

            tracing::info!(
                "Trying to connect to {} (attempt {}/{})",
                target.host,
                attempt,
                self.policy.max_attempts
            );

            let failure = match connector.open(target).await {
                Ok(session) => {
                    tracing::info!("Connected to {}", target.host);
                    return Ok(session);
                }
                Err(failure) => failure,
            };

            state = state.on_failure(&failure, &self.policy);
            match (state.clone(), failure) {
                (ConnectState::AuthFailed, ConnectFailure::Auth(message)) => {
                    tracing::error!("Authentication failed when connecting to {}", target.host);
                    return Err(DispatchError::AuthenticationFailed {
                        host: target.host.clone(),
                        message,
                    });
                }
                (ConnectState::HostKeyRejected, ConnectFailure::HostKey(message)) => {
                    tracing::error!("Host key for {} does not match: {}", target.host, message);
                    return Err(DispatchError::HostKeyMismatch(target.host.clone()));
                }
                (ConnectState::GaveUp { attempts }, ConnectFailure::Transient(message)) => {
                    tracing::error!(
                        "Could not connect to {}: {}. Giving up",
                        target.host,
                        message
                    );
                    return Err(DispatchError::HostUnreachable {
                        host: target.host.clone(),
                        attempts,
                    });
                }
                (
                    ConnectState::TransientFailure { failures },
                    ConnectFailure::Transient(message),
                ) => {
                    tracing::warn!(
                        "Could not SSH to {} ({}), waiting for it to start",
                        target.host,
                        message
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                    state = ConnectState::Connecting {
                        attempt: failures + 1,
                    };
                }
                (other, _) => {
                    return Err(DispatchError::Internal(format!(
                        "unexpected connection state {other:?}"
                    )));
                }
            }
        }
    }
}

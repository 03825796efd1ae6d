//! Connection state machine and reconnection policy.
//!
//! [`ConnectionState::apply`] is the single source of truth for which
//! transitions are legal:
//!
//! ```text
//! DISCONNECTED ──connect──▶ CONNECTING ──opened──▶ CONNECTED
//!                              │  ▲                    │
//!                        failed│  │connect          lost│
//!                              ▼  │                    ▼
//!                            ERROR ──retry──▶ RECONNECTING
//!
//! any ──disconnect──▶ DISCONNECTED
//! CONNECTING | CONNECTED ──fatal──▶ ERROR (budget exhausted)
//! ```

use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and none scheduled.
    #[default]
    Disconnected,
    /// An open attempt is in progress.
    Connecting,
    /// The transport is open and frames flow.
    Connected,
    /// Waiting for the backoff delay before the next attempt.
    Reconnecting,
    /// The last attempt failed, or the reconnect budget is spent.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Begin an open attempt.
    Connect,
    /// The transport opened.
    Opened,
    /// The open attempt failed or timed out.
    Failed,
    /// An established connection dropped or went silent.
    Lost,
    /// Leave ERROR to wait for the next attempt.
    Retry,
    /// The reconnect budget is exhausted.
    Fatal,
    /// Caller-initiated teardown.
    Disconnect,
}

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {transition:?} from {from}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: ConnectionState,
    /// Rejected input.
    pub transition: Transition,
}

impl ConnectionState {
    /// Compute the state that follows `transition`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `transition` is not legal from `self`.
    pub const fn apply(self, transition: Transition) -> Result<Self, InvalidTransition> {
        use ConnectionState as S;
        use Transition as T;

        let next = match (self, transition) {
            (S::Disconnected | S::Error | S::Reconnecting, T::Connect) => S::Connecting,
            (S::Connecting, T::Opened) => S::Connected,
            (S::Connecting, T::Failed) | (S::Connecting | S::Connected, T::Fatal) => S::Error,
            (S::Connected, T::Lost) | (S::Error, T::Retry) => S::Reconnecting,
            (_, T::Disconnect) => S::Disconnected,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(next)
    }
}

/// Reasons a connection failed, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The open attempt did not complete within the connection timeout.
    #[error("connection attempt timed out")]
    Timeout,

    /// The transport failed to open or dropped an established connection.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// No heartbeat reply arrived within the heartbeat timeout.
    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    /// Every reconnect attempt failed; caller action is required.
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Number of reconnect attempts made.
        attempts: u32,
    },
}

impl ConnectionError {
    /// Whether this error ends automatic reconnection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. })
    }
}

/// Exponential backoff: `delay(n) = min(base × 2^n, max)`, giving up after
/// `max_attempts` reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Number of reconnect attempts before the failure becomes fatal.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay to wait after `attempt` previous failed attempts.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Whether `attempt` previous attempts exhaust the budget.
    #[must_use]
    pub const fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// The current transport session, owned by the client task.
///
/// Mutated only through the transition methods below, each of which returns
/// the new state.
#[derive(Debug, Default)]
pub struct Connection {
    state: ConnectionState,
    attempt_count: u32,
    last_connected_at: Option<Instant>,
    /// Bumped whenever a transport session is started or abandoned, so that
    /// events from superseded sessions can be recognized.
    epoch: u64,
}

impl Connection {
    /// A fresh, disconnected session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed attempts since the last successful connection.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// When the session last entered CONNECTED.
    #[must_use]
    pub const fn last_connected_at(&self) -> Option<Instant> {
        self.last_connected_at
    }

    /// Identifier of the current transport session.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Apply a transition.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state untouched if the
    /// transition is not legal.
    pub fn apply(&mut self, transition: Transition) -> Result<ConnectionState, InvalidTransition> {
        self.state = self.state.apply(transition)?;
        Ok(self.state)
    }

    /// Start an open attempt under a new epoch.
    ///
    /// # Errors
    ///
    /// See [`Connection::apply`].
    pub fn begin_attempt(&mut self) -> Result<ConnectionState, InvalidTransition> {
        let state = self.apply(Transition::Connect)?;
        self.epoch += 1;
        Ok(state)
    }

    /// Record a successful open.
    ///
    /// # Errors
    ///
    /// See [`Connection::apply`].
    pub fn opened(&mut self, now: Instant) -> Result<ConnectionState, InvalidTransition> {
        let state = self.apply(Transition::Opened)?;
        self.attempt_count = 0;
        self.last_connected_at = Some(now);
        Ok(state)
    }

    /// Abandon the current transport session so its late events are ignored.
    pub const fn invalidate(&mut self) {
        self.epoch += 1;
    }

    /// Consume one attempt from the reconnect budget.
    ///
    /// Returns the delay to wait before the attempt, or `None` if the budget
    /// is exhausted.
    pub fn next_retry(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        if policy.is_exhausted(self.attempt_count) {
            return None;
        }
        let delay = policy.delay_for(self.attempt_count);
        self.attempt_count += 1;
        Some(delay)
    }

    /// Return to DISCONNECTED and clear the reconnect budget.
    pub fn disconnected(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.attempt_count = 0;
        self.epoch += 1;
        self.state
    }

    /// Clear the reconnect budget ahead of a caller-initiated connect.
    pub const fn reset_attempts(&mut self) {
        self.attempt_count = 0;
    }
}

use crate::recovery::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Connection state, one per client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The client worker has shut down; nothing works any more.
    ErrorTerminal,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ErrorTerminal => "error_terminal",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    /// Consecutive failed attempts (the first connect included) after which
    /// automatic reconnects stop, counted since the last liveness signal
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry number `attempt` (1-based) after `delay`
    Schedule { attempt: u32, delay: Duration },
    /// The last disconnect was manual
    Suppressed,
    /// Auto-reconnect is switched off
    Disabled,
    /// `attempts` consecutive failures reached the cap
    Exhausted { attempts: u32 },
}

/// The connection state machine. Pure bookkeeping: the worker owns it and
/// performs whatever I/O a transition calls for.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts: u32,
    manual_disconnect: bool,
}

impl ConnectionLifecycle {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts: 0,
            manual_disconnect: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_manual_disconnect(&self) -> bool {
        self.manual_disconnect
    }

    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Move to `Connecting`. Returns false when the caller must not open a
    /// transport: already connecting/connected, shut down, or an automatic
    /// retry racing a manual disconnect.
    pub fn begin_connect(&mut self, manual: bool) -> bool {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::ErrorTerminal => return false,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }

        if manual {
            self.manual_disconnect = false;
            self.attempts = 0;
        } else if self.manual_disconnect {
            debug!("Automatic connect suppressed after manual disconnect");
            return false;
        }

        self.transition(ConnectionState::Connecting);
        true
    }

    pub fn on_open(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.transition(ConnectionState::Connected);
        }
    }

    /// A verified liveness signal: the only automatic reset of the retry counter
    pub fn on_liveness_ack(&mut self) {
        if self.attempts != 0 {
            debug!(previous = self.attempts, "Reconnect attempts reset by liveness ack");
        }
        self.attempts = 0;
    }

    pub fn on_failure(&mut self) {
        if self.state != ConnectionState::ErrorTerminal {
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Decide whether to schedule the next automatic reconnect.
    /// `delay_override` replaces the backoff delay (immediate retries).
    pub fn plan_reconnect(&mut self, delay_override: Option<Duration>) -> ReconnectDecision {
        if self.manual_disconnect {
            return ReconnectDecision::Suppressed;
        }
        if !self.policy.auto_reconnect {
            return ReconnectDecision::Disabled;
        }
        if self.state == ConnectionState::ErrorTerminal {
            return ReconnectDecision::Suppressed;
        }
        // the failure being handled is attempt `attempts + 1`
        let failures = self.attempts.saturating_add(1);
        if failures >= self.policy.max_attempts {
            self.transition(ConnectionState::Disconnected);
            return ReconnectDecision::Exhausted { attempts: failures };
        }

        let delay = delay_override.unwrap_or_else(|| self.policy.backoff.delay(self.attempts));
        self.attempts += 1;
        self.transition(ConnectionState::Reconnecting);
        ReconnectDecision::Schedule {
            attempt: self.attempts,
            delay,
        }
    }

    /// Drop a pending reconnect without touching the counter
    pub fn cancel_reconnect(&mut self) {
        if self.state == ConnectionState::Reconnecting {
            self.transition(ConnectionState::Disconnected);
        }
    }

    pub fn mark_manual_disconnect(&mut self) {
        self.manual_disconnect = true;
        if self.state != ConnectionState::ErrorTerminal {
            self.transition(ConnectionState::Disconnected);
        }
    }

    pub fn terminate(&mut self) {
        self.transition(ConnectionState::ErrorTerminal);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Connection state transition");
            self.state = next;
        }
    }
}

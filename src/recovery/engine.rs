use super::classifier::{classify, BackoffPolicy, ErrorContext, ErrorKind, ErrorRecord, RecoveryStrategy};
use crate::network::{ConnectionError, ConnectionQuality, NetworkPath, ReachabilityStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DIAGNOSTICS_RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub auto_recovery: bool,
    /// Automatic recovery stops once this many consecutive failures are on
    /// record
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub history_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recovery: true,
            max_attempts: 10,
            backoff: BackoffPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// What the caller should do about the current error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Arm a single-shot retry timer
    Retry {
        strategy: RecoveryStrategy,
        delay: Duration,
    },
    /// Nothing until reachability comes back
    WaitForNetwork,
    Exhausted {
        attempts: u32,
    },
    NotRecoverable,
    /// Auto-recovery is off; waiting for a manual trigger
    Deferred,
    NoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDiagnostics {
    pub current_error: Option<ErrorRecord>,
    pub reachability: ReachabilityStatus,
    pub quality: ConnectionQuality,
    pub consecutive_failures: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    pub retry_pending: bool,
    pub total_errors: u64,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Classifies failures, keeps bounded history, and decides how to recover.
/// Owned by the client worker; it never performs I/O or arms timers itself.
#[derive(Debug)]
pub struct ErrorRecoveryEngine {
    config: RecoveryConfig,
    history: VecDeque<ErrorRecord>,
    current: Option<ErrorRecord>,
    consecutive_failures: u32,
    path: NetworkPath,
    last_recovery_attempt: Option<DateTime<Utc>>,
    retry_pending: bool,
    total_errors: u64,
}

impl ErrorRecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            current: None,
            consecutive_failures: 0,
            path: NetworkPath::available(),
            last_recovery_attempt: None,
            retry_pending: false,
            total_errors: 0,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn current_error(&self) -> Option<&ErrorRecord> {
        self.current.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.history.iter()
    }

    pub fn path(&self) -> NetworkPath {
        self.path
    }

    /// Classify and record a failure, then decide on recovery
    pub fn handle_error(
        &mut self,
        error: &ConnectionError,
        context: ErrorContext,
    ) -> (ErrorRecord, RecoveryDecision) {
        let classification = classify(error, self.path.status);
        let record = ErrorRecord::new(classification, error.to_string(), context);

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_errors += 1;
        self.history.push_back(record.clone());
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
        self.current = Some(record.clone());

        warn!(
            kind = %record.kind,
            severity = %record.severity,
            recoverable = record.recoverable,
            consecutive = self.consecutive_failures,
            operation = %record.context.operation,
            "Recorded error: {}",
            record.message
        );

        let decision = if self.config.auto_recovery {
            self.plan(false)
        } else {
            RecoveryDecision::Deferred
        };
        debug!(?decision, "Recovery decision");
        (record, decision)
    }

    /// User-initiated retry of the current error. Ignores the attempt cap
    /// and retries without delay, except that a network-unavailable error
    /// keeps waiting while the network is still down.
    pub fn trigger_recovery(&mut self) -> RecoveryDecision {
        let decision = self.plan(true);
        info!(?decision, "Manual recovery triggered");
        decision
    }

    fn plan(&mut self, manual: bool) -> RecoveryDecision {
        let Some(current) = &self.current else {
            return RecoveryDecision::NoError;
        };
        let strategy = current.strategy();

        let decision = if strategy == RecoveryStrategy::WaitForNetwork {
            if self.path.is_available() {
                RecoveryDecision::Retry {
                    strategy: RecoveryStrategy::ImmediateRetry,
                    delay: Duration::ZERO,
                }
            } else {
                RecoveryDecision::WaitForNetwork
            }
        } else if manual {
            RecoveryDecision::Retry {
                strategy: RecoveryStrategy::ImmediateRetry,
                delay: Duration::ZERO,
            }
        } else if !current.recoverable || strategy == RecoveryStrategy::None {
            RecoveryDecision::NotRecoverable
        } else if self.consecutive_failures >= self.config.max_attempts {
            RecoveryDecision::Exhausted {
                attempts: self.config.max_attempts,
            }
        } else {
            let delay = match strategy {
                RecoveryStrategy::ExponentialBackoff => self
                    .config
                    .backoff
                    .delay(self.consecutive_failures.saturating_sub(1)),
                _ => Duration::ZERO,
            };
            RecoveryDecision::Retry { strategy, delay }
        };

        if matches!(decision, RecoveryDecision::Retry { .. }) {
            self.retry_pending = true;
        }
        decision
    }

    /// The retry timer fired: clear the current error and report its kind
    pub fn on_retry_fired(&mut self) -> Option<ErrorKind> {
        self.retry_pending = false;
        self.last_recovery_attempt = Some(Utc::now());
        self.current.take().map(|record| record.kind)
    }

    /// Reset current error and failure counter. Returns whether a scheduled
    /// retry was pending, so the caller can cancel its timer.
    pub fn clear_error(&mut self) -> bool {
        let had_pending = self.retry_pending;
        if self.current.take().is_some() || self.consecutive_failures > 0 {
            info!(
                consecutive = self.consecutive_failures,
                "Error state cleared"
            );
        }
        self.consecutive_failures = 0;
        self.retry_pending = false;
        had_pending
    }

    /// Forget a scheduled retry but keep the current error on record.
    /// Returns whether one was pending.
    pub fn cancel_retry(&mut self) -> bool {
        std::mem::replace(&mut self.retry_pending, false)
    }

    pub fn record_liveness_ack(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Feed a reachability reading. Returns true when the network came back
    /// while the current error is network-unavailable: recovery must run now.
    pub fn update_reachability(&mut self, path: NetworkPath) -> bool {
        let was_available = self.path.is_available();
        self.path = path;

        let recovered = !was_available
            && path.is_available()
            && self
                .current
                .as_ref()
                .map(|record| record.kind == ErrorKind::NetworkUnavailable)
                .unwrap_or(false);
        if recovered {
            info!("Network is back, recovering immediately");
            self.retry_pending = true;
        }
        recovered
    }

    pub fn diagnostics(&self) -> RecoveryDiagnostics {
        let skip = self.history.len().saturating_sub(DIAGNOSTICS_RECENT_ERRORS);
        RecoveryDiagnostics {
            current_error: self.current.clone(),
            reachability: self.path.status,
            quality: self.path.quality(),
            consecutive_failures: self.consecutive_failures,
            last_recovery_attempt: self.last_recovery_attempt,
            retry_pending: self.retry_pending,
            total_errors: self.total_errors,
            recent_errors: self.history.iter().skip(skip).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(max_attempts: u32) -> ErrorRecoveryEngine {
        ErrorRecoveryEngine::new(RecoveryConfig {
            auto_recovery: true,
            max_attempts,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2.0),
            history_limit: 5,
        })
    }

    fn ctx() -> ErrorContext {
        ErrorContext::new("connect", 0)
    }

    #[test]
    fn test_backoff_delays_grow_with_consecutive_failures() {
        let mut engine = engine(10);
        let mut delays = Vec::new();
        for _ in 0..6 {
            let (_, decision) = engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
            match decision {
                RecoveryDecision::Retry { strategy, delay } => {
                    assert_eq!(strategy, RecoveryStrategy::ExponentialBackoff);
                    delays.push(delay.as_secs());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn test_timeout_retries_immediately() {
        let mut engine = engine(3);
        let (record, decision) =
            engine.handle_error(&ConnectionError::LivenessTimeout { nonce: 1 }, ctx());
        assert_eq!(record.kind, ErrorKind::Timeout);
        assert_eq!(
            decision,
            RecoveryDecision::Retry {
                strategy: RecoveryStrategy::ImmediateRetry,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_attempt_cap_stops_automatic_recovery() {
        let mut engine = engine(2);
        let (_, decision) = engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        assert!(matches!(decision, RecoveryDecision::Retry { .. }));

        // the second consecutive failure reaches the cap
        let (_, decision) = engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        assert_eq!(decision, RecoveryDecision::Exhausted { attempts: 2 });
        assert_eq!(engine.consecutive_failures(), 2);

        // manual trigger still works
        assert!(matches!(
            engine.trigger_recovery(),
            RecoveryDecision::Retry { delay: Duration::ZERO, .. }
        ));
    }

    #[test]
    fn test_unknown_errors_are_never_auto_retried() {
        let mut engine = engine(5);
        let (record, decision) =
            engine.handle_error(&ConnectionError::Other("weird".to_string()), ctx());
        assert_eq!(record.kind, ErrorKind::Unknown);
        assert_eq!(decision, RecoveryDecision::NotRecoverable);
    }

    #[test]
    fn test_auto_recovery_off_defers() {
        let mut engine = ErrorRecoveryEngine::new(RecoveryConfig {
            auto_recovery: false,
            ..RecoveryConfig::default()
        });
        let (_, decision) = engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        assert_eq!(decision, RecoveryDecision::Deferred);
        assert!(matches!(
            engine.trigger_recovery(),
            RecoveryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let mut engine = engine(100);
        for i in 0..8 {
            engine.handle_error(&ConnectionError::Other(format!("e{}", i)), ctx());
        }
        let messages: Vec<&str> = engine.history().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["e3", "e4", "e5", "e6", "e7"]);
        assert_eq!(engine.diagnostics().total_errors, 8);
    }

    #[test]
    fn test_diagnostics_return_at_most_ten_recent() {
        let mut engine = ErrorRecoveryEngine::new(RecoveryConfig::default());
        for i in 0..25 {
            engine.handle_error(&ConnectionError::Other(format!("e{}", i)), ctx());
        }
        let diagnostics = engine.diagnostics();
        assert_eq!(diagnostics.recent_errors.len(), DIAGNOSTICS_RECENT_ERRORS);
        assert_eq!(diagnostics.recent_errors[9].message, "e24");
        assert_eq!(diagnostics.consecutive_failures, 25);
    }

    #[test]
    fn test_clear_error_resets_state() {
        let mut engine = engine(5);
        engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        assert!(engine.clear_error());
        assert!(engine.current_error().is_none());
        assert_eq!(engine.consecutive_failures(), 0);
        assert!(!engine.clear_error());
        assert_eq!(engine.trigger_recovery(), RecoveryDecision::NoError);
    }

    #[test]
    fn test_liveness_ack_resets_counter_only() {
        let mut engine = engine(5);
        engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        engine.record_liveness_ack();
        assert_eq!(engine.consecutive_failures(), 0);
        assert!(engine.current_error().is_some());
    }

    #[test]
    fn test_retry_firing_clears_current_error() {
        let mut engine = engine(5);
        engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        assert!(engine.diagnostics().retry_pending);
        assert_eq!(engine.on_retry_fired(), Some(ErrorKind::ConnectionFailed));
        let diagnostics = engine.diagnostics();
        assert!(diagnostics.current_error.is_none());
        assert!(!diagnostics.retry_pending);
        assert!(diagnostics.last_recovery_attempt.is_some());
        assert_eq!(diagnostics.consecutive_failures, 1);
    }

    #[test]
    fn test_network_return_triggers_immediate_recovery() {
        let mut engine = engine(5);
        assert!(!engine.update_reachability(NetworkPath::unavailable()));

        let (record, decision) = engine.handle_error(&ConnectionError::ConnectionClosed, ctx());
        assert_eq!(record.kind, ErrorKind::NetworkUnavailable);
        assert_eq!(decision, RecoveryDecision::WaitForNetwork);
        assert_eq!(engine.diagnostics().quality, ConnectionQuality::Unavailable);

        assert!(engine.update_reachability(NetworkPath::available()));
        assert_eq!(engine.on_retry_fired(), Some(ErrorKind::NetworkUnavailable));
        assert!(!engine.update_reachability(NetworkPath::available()));
    }

    #[test]
    fn test_network_return_ignored_for_other_kinds() {
        let mut engine = engine(5);
        engine.handle_error(&ConnectionError::Other("x".to_string()), ctx());
        engine.update_reachability(NetworkPath::unavailable());
        assert!(!engine.update_reachability(NetworkPath::available()));
    }
}

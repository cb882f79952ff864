//! Error classification and recovery.
//!
//! Failures coming out of the connection layer are classified into a fixed
//! taxonomy, recorded in a bounded history, and turned into a recovery
//! decision. The engine only decides; the client worker arms the timers.

pub mod classifier;
pub mod engine;
pub mod presentation;

pub use classifier::{
    classify, BackoffPolicy, Classification, ErrorCategory, ErrorContext, ErrorKind, ErrorRecord,
    RecoveryStrategy, Severity,
};
pub use engine::{
    ErrorRecoveryEngine, RecoveryConfig, RecoveryDecision, RecoveryDiagnostics,
    DEFAULT_HISTORY_LIMIT, DIAGNOSTICS_RECENT_ERRORS,
};
pub use presentation::ErrorPresentation;

use super::config::ConfigError;
use crate::messages::WireProtocolError;
use crate::network::{ClientError, ConnectionError, ReachabilityStatus};
use crate::recovery::{classify, ErrorPresentation};
use crate::state::StorageError;
use std::fmt;

/// Unified error type for CLI operations with user-friendly messages
#[derive(Debug)]
pub enum CliError {
    /// Client worker or operation error
    Client(ClientError),
    /// Transport or link error
    Connection(ConnectionError),
    /// Snapshot storage error
    Storage(StorageError),
    /// Configuration file or value error
    Config(ConfigError),
    /// Wire protocol error
    Wire(WireProtocolError),
    /// Input validation error
    InvalidInput {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },
    /// User-friendly error with custom message
    UserError {
        message: String,
        suggestion: Option<String>,
    },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Client(e) => write!(f, "{}", format_client_error(e)),
            CliError::Connection(e) => write!(f, "{}", format_connection_error(e)),
            CliError::Storage(e) => write!(f, "{}", format_storage_error(e)),
            CliError::Config(e) => write!(f, "{}", format_config_error(e)),
            CliError::Wire(e) => write!(f, "{}", format_wire_error(e)),
            CliError::InvalidInput {
                field,
                value,
                reason,
                suggestion,
            } => {
                write!(
                    f,
                    "❌ Invalid {}: '{}'\n   Reason: {}\n   💡 Suggestion: {}",
                    field, value, reason, suggestion
                )
            }
            CliError::UserError {
                message,
                suggestion,
            } => {
                if let Some(suggestion) = suggestion {
                    write!(f, "❌ {}\n   💡 Suggestion: {}", message, suggestion)
                } else {
                    write!(f, "❌ {}", message)
                }
            }
        }
    }
}

impl std::error::Error for CliError {}

impl From<ClientError> for CliError {
    fn from(err: ClientError) -> Self {
        CliError::Client(err)
    }
}

impl From<ConnectionError> for CliError {
    fn from(err: ConnectionError) -> Self {
        CliError::Connection(err)
    }
}

impl From<StorageError> for CliError {
    fn from(err: StorageError) -> Self {
        CliError::Storage(err)
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Config(err)
    }
}

impl From<WireProtocolError> for CliError {
    fn from(err: WireProtocolError) -> Self {
        CliError::Wire(err)
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        // Recover the typed error when one sits underneath the context chain
        let err = match err.downcast::<ClientError>() {
            Ok(e) => return CliError::Client(e),
            Err(err) => err,
        };
        let err = match err.downcast::<ConfigError>() {
            Ok(e) => return CliError::Config(e),
            Err(err) => err,
        };
        let err = match err.downcast::<StorageError>() {
            Ok(e) => return CliError::Storage(e),
            Err(err) => err,
        };
        let err = match err.downcast::<ConnectionError>() {
            Ok(e) => return CliError::Connection(e),
            Err(err) => err,
        };

        CliError::UserError {
            message: format!("{:#}", err),
            suggestion: Some("Check the error details above and try again.".to_string()),
        }
    }
}

fn format_client_error(error: &ClientError) -> String {
    match error {
        ClientError::Connection(e) => format_connection_error(e),
        ClientError::Storage(e) => format_storage_error(e),
        ClientError::Serialization(e) => {
            format!("🔧 Data format error: {}\n   💡 Suggestion: This may be a bug. Please report this issue.", e)
        }
    }
}

/// Connection errors are rendered through the same presentation the
/// recovery engine hands to event sinks
fn format_connection_error(error: &ConnectionError) -> String {
    match error {
        ConnectionError::NotConnected { state } => format!(
            "🔌 Not connected (state: {})\n   💡 Suggestion: Run 'livelink connect' first or wait for the reconnect to finish.",
            state
        ),
        ConnectionError::ClientShutdown => {
            "🔌 The client has shut down.\n   💡 Suggestion: Start a new session with 'livelink connect'.".to_string()
        }
        _ => {
            let classification = classify(error, ReachabilityStatus::Available);
            let presentation = ErrorPresentation::for_kind(classification.kind);
            format!("{}\n   Details: {}", presentation, error)
        }
    }
}

fn format_storage_error(error: &StorageError) -> String {
    format!(
        "💾 Snapshot storage error: {}\n   💡 Suggestion: {}",
        error,
        error.recovery_suggestion()
    )
}

fn format_config_error(error: &ConfigError) -> String {
    let suggestion = match error {
        ConfigError::Io { .. } => "Check that the configuration directory exists and is writable.",
        ConfigError::Parse(_) => "Fix the TOML syntax or regenerate the file with 'livelink config init --force'.",
        ConfigError::Serialize(_) => "This may be a bug. Please report this issue.",
        ConfigError::Invalid { .. } => "Edit the value in the configuration file or override it with a command-line flag.",
        ConfigError::ConfigDirUnavailable => "Pass an explicit file with --config.",
        ConfigError::Pattern(_) => "This may be a bug. Please report this issue.",
    };
    format!(
        "⚙️  Configuration Error: {}\n   💡 Suggestion: {}",
        error, suggestion
    )
}

fn format_wire_error(error: &WireProtocolError) -> String {
    let suggestion = if error.is_timeout() {
        "The server may be slow or overloaded. Try again later."
    } else if error.is_protocol_violation() {
        "The server may be running an incompatible protocol version."
    } else {
        "Check the connection and try again."
    };
    format!("📡 Wire protocol error: {}\n   💡 Suggestion: {}", error, suggestion)
}

/// Create an input validation error with helpful suggestions
pub fn create_input_validation_error(field: &str, value: &str, reason: &str) -> CliError {
    let suggestion = match field {
        "host" => "Use a hostname or IPv4 address, e.g. 'localhost' or '192.168.1.100'.".to_string(),
        "port" => "Use a port between 1 and 65535.".to_string(),
        "client_id" => "Use letters, digits, '.', '_' or '-' (a UUID works).".to_string(),
        "path" => "Use a URL path such as '/live'.".to_string(),
        _ => "Check the input format and try again.".to_string(),
    };

    CliError::InvalidInput {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
        suggestion,
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// Display an error with proper formatting and exit codes
pub fn display_error_and_exit(error: CliError, exit_code: i32) -> ! {
    eprintln!("\n{}", error);
    std::process::exit(exit_code);
}

/// Check if an error is recoverable (user can retry)
pub fn is_recoverable_error(error: &CliError) -> bool {
    match error {
        CliError::Connection(e) | CliError::Client(ClientError::Connection(e)) => {
            !matches!(e, ConnectionError::ClientShutdown)
        }
        CliError::InvalidInput { .. } | CliError::Wire(_) => true,
        CliError::Storage(StorageError::Io(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_uses_presentation() {
        let err = CliError::from(ConnectionError::ConnectFailed {
            endpoint: "127.0.0.1:1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
        let text = err.to_string();
        assert!(text.starts_with("❌ "));
        assert!(text.contains("💡 Suggestion:"));
        assert!(text.contains("127.0.0.1:1"));
        assert!(is_recoverable_error(&err));
    }

    #[test]
    fn test_anyhow_downcast_keeps_typed_error() {
        let err = anyhow::Error::from(ConfigError::ConfigDirUnavailable).context("loading config");
        assert!(matches!(CliError::from(err), CliError::Config(_)));

        let err = anyhow::anyhow!("something odd");
        assert!(matches!(CliError::from(err), CliError::UserError { .. }));
    }

    #[test]
    fn test_shutdown_is_not_recoverable() {
        let err = CliError::from(ClientError::from(ConnectionError::ClientShutdown));
        assert!(!is_recoverable_error(&err));
        assert!(err.to_string().contains("shut down"));
    }

    #[test]
    fn test_validation_error_suggestion() {
        let err = create_input_validation_error("port", "0", "must not be 0");
        assert!(err.to_string().contains("between 1 and 65535"));
    }
}

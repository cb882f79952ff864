use super::classifier::{ErrorKind, ErrorRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to show a human for an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub description: String,
    pub suggestion: String,
}

impl ErrorPresentation {
    pub fn for_kind(kind: ErrorKind) -> Self {
        let (title, description, suggestion) = match kind {
            ErrorKind::NetworkUnavailable => (
                "No network connection",
                "This device is offline.",
                "Reconnect to a network. The client will retry as soon as the network is back.",
            ),
            ErrorKind::ServerUnreachable => (
                "Server unreachable",
                "The development server refused or dropped the connection.",
                "Check that the server is running and that host and port are correct.",
            ),
            ErrorKind::Timeout => (
                "Connection timed out",
                "The server did not respond in time.",
                "The server may be busy or the network slow. A retry is on its way.",
            ),
            ErrorKind::ConnectionFailed => (
                "Connection lost",
                "The connection to the server closed unexpectedly.",
                "The client reconnects automatically. Check the server logs if this keeps happening.",
            ),
            ErrorKind::ProtocolError => (
                "Protocol error",
                "A message from the server could not be understood.",
                "Make sure client and server run compatible versions.",
            ),
            ErrorKind::ServerError => (
                "Server error",
                "The server reported an error.",
                "Check the server output for details.",
            ),
            ErrorKind::InternalError => (
                "Internal error",
                "The client hit an unexpected internal problem.",
                "Retry the operation. If it keeps failing, restart the client.",
            ),
            ErrorKind::Unknown => (
                "Unexpected error",
                "Something went wrong that the client does not recognize.",
                "Use trigger recovery to retry manually, or restart the client.",
            ),
        };
        Self {
            title: title.to_string(),
            description: description.to_string(),
            suggestion: suggestion.to_string(),
        }
    }

    /// Like [`for_kind`](Self::for_kind), with the record's message appended
    /// to the description
    pub fn for_record(record: &ErrorRecord) -> Self {
        let mut presentation = Self::for_kind(record.kind);
        if !record.message.is_empty() {
            presentation.description = format!("{} ({})", presentation.description, record.message);
        }
        presentation
    }
}

impl fmt::Display for ErrorPresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "❌ {}: {}\n   💡 Suggestion: {}",
            self.title, self.description, self.suggestion
        )
    }
}

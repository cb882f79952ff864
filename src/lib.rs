pub mod cli;
pub mod messages;
pub mod network;
pub mod recovery;
pub mod state;

// Re-export key types for easy testing
pub use messages::{Envelope, FramedMessage, WireConfig};
pub use network::{ClientEvent, ClientOptions, ConnectionState, Endpoint, LiveClient};
pub use recovery::{ErrorKind, ErrorRecoveryEngine};
pub use state::{SourceArtifact, StateSnapshotService, StateValue};

pub mod app;
pub mod commands;
pub mod config;
pub mod display;
pub mod error_handler;

pub use app::App;
pub use commands::{Cli, Commands, ConfigCommand, ConnectArgs, SnapshotCommand};
pub use config::{ClientConfig, ConfigError};
pub use display::{
    display_diagnostics, display_event, display_snapshot_list, display_snapshot_stats,
    format_bytes,
};
pub use error_handler::{
    create_input_validation_error, display_error_and_exit, is_recoverable_error, CliError,
    CliResult,
};

use anyhow::Result;
use clap::Parser;
use livelink::cli::{display_error_and_exit, App, CliError, Cli, Commands};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("livelink={}", default_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut app = App::new(cli.config)?;
    debug!(path = %app.config_path.display(), "Loaded configuration");

    match cli.command {
        Commands::Connect(args) => app.handle_connect(args).await,
        Commands::Snapshots { command } => app.handle_snapshots(command),
        Commands::Config { command } => app.handle_config(command),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        display_error_and_exit(CliError::from(e), 1);
    }
}

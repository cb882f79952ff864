use super::commands::{ConfigCommand, ConnectArgs, SnapshotCommand};
use super::config::ClientConfig;
use super::display::{
    display_diagnostics, display_event, display_snapshot_list, display_snapshot_stats,
};
use super::error_handler::create_input_validation_error;
use crate::network::{
    ChannelEventSink, LiveClient, ReachabilityMonitor, RouteProbe, SystemDeviceInfo,
};
use crate::messages::DeviceInfo;
use crate::state::{
    default_snapshot_dir, MemoryStateStore, SnapshotConfig, SnapshotStore, StateSnapshotService,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Main application state
pub struct App {
    /// Application configuration
    pub config: ClientConfig,
    /// Where the configuration was loaded from
    pub config_path: PathBuf,
}

impl App {
    /// Load the configuration, creating the default file on first run
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => ClientConfig::default_config_file()
                .context("Failed to determine configuration file location")?,
        };
        let config = ClientConfig::load_or_create(&config_path)
            .context("Failed to initialize configuration")?;
        config.validate().context("Configuration is invalid")?;

        Ok(App {
            config,
            config_path,
        })
    }

    /// Directory persisted snapshots live in
    pub fn snapshot_dir(&self) -> Result<PathBuf> {
        match &self.config.snapshots.directory {
            Some(dir) => Ok(dir.clone()),
            None => default_snapshot_dir().context("Failed to determine snapshot directory"),
        }
    }

    /// Apply command-line overrides on top of the file configuration
    pub fn apply_overrides(&mut self, args: &ConnectArgs) -> Result<()> {
        if let Some(host) = &args.host {
            self.config.server.host = host.clone();
        }
        if let Some(port) = args.port {
            if port == 0 {
                return Err(create_input_validation_error("port", "0", "must not be 0").into());
            }
            self.config.server.port = port;
        }
        if let Some(path) = &args.path {
            self.config.server.path = path.clone();
        }
        if let Some(client_id) = &args.client_id {
            self.config.client.client_id = client_id.clone();
        }
        if let Some(client_name) = &args.client_name {
            self.config.client.client_name = client_name.clone();
        }
        if args.no_reconnect {
            self.config.reconnect.auto_reconnect = false;
        }
        if args.no_heartbeat {
            self.config.heartbeat.enabled = false;
        }
        self.config
            .validate()
            .context("Command-line overrides produced an invalid configuration")?;
        Ok(())
    }

    /// Route probe toward the server when its address resolves
    async fn reachability_monitor(&self) -> ReachabilityMonitor {
        let authority = self.config.endpoint().authority();
        let looked = tokio::net::lookup_host(authority.clone()).await;
        match looked {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => ReachabilityMonitor::spawn(
                    Arc::new(RouteProbe::new(addr)),
                    self.config.reachability_interval(),
                ),
                None => ReachabilityMonitor::always_available(),
            },
            Err(e) => {
                warn!(error = %e, authority = %authority, "Could not resolve server; reachability probing disabled");
                ReachabilityMonitor::always_available()
            }
        }
    }

    /// Handle the 'connect' command - stay connected until Ctrl-C or the duration elapses
    pub async fn handle_connect(&mut self, args: ConnectArgs) -> Result<()> {
        self.apply_overrides(&args)?;
        let options = self.config.to_options();
        let reachability = self.reachability_monitor().await;
        let (sink, mut events) = ChannelEventSink::new();

        let client = LiveClient::builder(options)
            .device_info(Arc::new(SystemDeviceInfo::new(
                self.config.client.client_id.clone(),
            )))
            .reachability(reachability)
            .event_sink(Arc::new(sink))
            .state_store(Arc::new(MemoryStateStore::new()))
            .build()
            .await
            .context("Failed to start client")?;

        info!(endpoint = %client.endpoint(), client_id = %client.client_id(), "Starting session");
        if args.register {
            client
                .register_client(self.config.client.capabilities.clone(), None)
                .await
                .context("Failed to queue registration")?;
        }
        client.connect().await.context("Failed to connect")?;

        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                display_event(&event);
            }
        });

        match args.duration {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            None => {
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for Ctrl-C")?;
            }
        }

        println!();
        client.disconnect().await.context("Failed to disconnect")?;
        let diagnostics = client
            .diagnostics()
            .await
            .context("Failed to collect diagnostics")?;
        display_diagnostics(&diagnostics);
        println!(
            "{}",
            serde_json::to_string_pretty(&diagnostics).context("Failed to encode diagnostics")?
        );

        client.shutdown().await.context("Failed to shut down client")?;
        drop(client);
        printer.abort();
        Ok(())
    }

    /// Snapshot service seeded from disk, for offline inspection
    fn offline_snapshots(&self, store: &SnapshotStore) -> Result<StateSnapshotService> {
        let records = store
            .load_all()
            .with_context(|| format!("Failed to read snapshots from {}", store.dir().display()))?;
        let config = SnapshotConfig {
            persistence_enabled: false,
            ..self.snapshot_config()
        };
        let mut service = StateSnapshotService::new(config, self.device_info());
        service.load_history(records, Utc::now());
        Ok(service)
    }

    fn snapshot_config(&self) -> SnapshotConfig {
        self.config.to_options().snapshots
    }

    fn device_info(&self) -> DeviceInfo {
        use crate::network::DeviceInfoProvider;
        SystemDeviceInfo::new(self.config.client.client_id.clone()).device_info()
    }

    /// Handle the 'snapshots' command family
    pub fn handle_snapshots(&self, command: SnapshotCommand) -> Result<()> {
        let store = SnapshotStore::new(self.snapshot_dir()?);

        match command {
            SnapshotCommand::List => {
                let records = store.load_all().context("Failed to read snapshots")?;
                println!("Snapshot directory: {}", store.dir().display());
                display_snapshot_list(&records);
            }
            SnapshotCommand::Stats => {
                let service = self.offline_snapshots(&store)?;
                let mut stats = service.stats();
                stats.persistence_enabled = self.config.snapshots.persistence_enabled;
                stats.storage_bytes = store
                    .storage_bytes()
                    .context("Failed to measure snapshot storage")?;
                display_snapshot_stats(&stats);
            }
            SnapshotCommand::Export { output } => {
                let service = self.offline_snapshots(&store)?;
                let json = serde_json::to_string_pretty(&service.export_diagnostics())
                    .context("Failed to encode diagnostics")?;
                match output {
                    Some(path) => {
                        write_file(&path, &json)?;
                        println!("Diagnostics written to {}", path.display());
                    }
                    None => println!("{}", json),
                }
            }
            SnapshotCommand::Clear { yes } => {
                if !yes {
                    println!(
                        "This deletes every snapshot in {}. Re-run with --yes to confirm.",
                        store.dir().display()
                    );
                    return Ok(());
                }
                let removed = store.clear().context("Failed to clear snapshots")?;
                println!("Removed {} snapshot file(s).", removed);
            }
        }
        Ok(())
    }

    /// Handle the 'config' command family
    pub fn handle_config(&self, command: ConfigCommand) -> Result<()> {
        match command {
            ConfigCommand::Path => {
                println!("Configuration file: {}", self.config_path.display());
                if let Ok(dir) = self.snapshot_dir() {
                    println!("Snapshot directory: {}", dir.display());
                }
            }
            ConfigCommand::Show => {
                let content = toml::to_string_pretty(&self.config)
                    .context("Failed to serialize configuration")?;
                println!("# {}", self.config_path.display());
                println!("{}", content);
            }
            ConfigCommand::Init { force } => {
                if self.config_path.exists() && !force {
                    println!(
                        "Configuration already exists at {}. Use --force to overwrite.",
                        self.config_path.display()
                    );
                    return Ok(());
                }
                ClientConfig::default()
                    .save(&self.config_path)
                    .context("Failed to write configuration")?;
                println!("Wrote default configuration to {}", self.config_path.display());
            }
        }
        Ok(())
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LayoutNode, SourceArtifact, SourceDescriptor, StateSnapshot, StateValue};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn app(dir: &TempDir) -> App {
        let mut config = ClientConfig::default();
        config.snapshots.directory = Some(dir.path().join("snapshots"));
        App {
            config,
            config_path: dir.path().join("config.toml"),
        }
    }

    #[test]
    fn test_overrides_apply_and_validate() {
        let dir = TempDir::new().unwrap();
        let mut app = app(&dir);
        let args = ConnectArgs {
            host: Some("localhost".to_string()),
            port: Some(9100),
            no_reconnect: true,
            ..ConnectArgs::default()
        };
        app.apply_overrides(&args).unwrap();
        assert_eq!(app.config.server.port, 9100);
        assert!(!app.config.reconnect.auto_reconnect);

        let bad = ConnectArgs {
            host: Some("not a host".to_string()),
            ..ConnectArgs::default()
        };
        assert!(app.apply_overrides(&bad).is_err());
    }

    #[test]
    fn test_offline_snapshot_commands() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        let store = SnapshotStore::new(app.snapshot_dir().unwrap());

        let mut service = StateSnapshotService::new(SnapshotConfig::default(), app.device_info());
        let source = SourceArtifact::new(
            SourceDescriptor::new("Main.view", "r1"),
            LayoutNode::new("root").with_state_keys(["count"]),
        );
        let mut state: BTreeMap<String, StateValue> = BTreeMap::new();
        state.insert("count".to_string(), StateValue::Int(3));
        let snapshot: StateSnapshot = service.create_snapshot(&source, &state);
        store.write(&snapshot).unwrap();

        let offline = app.offline_snapshots(&store).unwrap();
        assert_eq!(offline.len(), 1);

        let output = dir.path().join("export.json");
        app.handle_snapshots(SnapshotCommand::Export {
            output: Some(output.clone()),
        })
        .unwrap();
        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(exported["history"].as_array().unwrap().len(), 1);

        app.handle_snapshots(SnapshotCommand::Clear { yes: false })
            .unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
        app.handle_snapshots(SnapshotCommand::Clear { yes: true })
            .unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reachability_monitor_resolves_server_address() {
        let dir = TempDir::new().unwrap();
        let mut app = app(&dir);
        app.config.server.host = "127.0.0.1".to_string();
        let monitor = app.reachability_monitor().await;
        assert!(monitor.current().is_available());
        assert!(monitor.subscribe().borrow().is_available());
    }

    #[test]
    fn test_config_init_respects_existing_file() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);
        app.handle_config(ConfigCommand::Init { force: false })
            .unwrap();
        assert!(app.config_path.exists());

        std::fs::write(&app.config_path, "[server]\nport = 9999\n").unwrap();
        app.handle_config(ConfigCommand::Init { force: false })
            .unwrap();
        let kept = ClientConfig::load(&app.config_path).unwrap();
        assert_eq!(kept.server.port, 9999);

        app.handle_config(ConfigCommand::Init { force: true })
            .unwrap();
        let reset = ClientConfig::load(&app.config_path).unwrap();
        assert_eq!(reset.server.port, 8080);
    }
}

use crate::network::{ClientDiagnostics, ClientEvent};
use crate::state::{SnapshotStats, StateSnapshot};
use chrono::{DateTime, Utc};

fn short(hash: &str, width: usize) -> &str {
    &hash[..width.min(hash.len())]
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Display persisted snapshots in a box-drawn table
pub fn display_snapshot_list(snapshots: &[StateSnapshot]) {
    if snapshots.is_empty() {
        println!("No snapshots found.");
        return;
    }

    let hash_width = 12;
    let time_width = 19;
    let keys_width = 4;
    let platform_width = snapshots
        .iter()
        .map(|s| s.metadata.platform.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "┌{:─<w_id$}┬{:─<w_st$}┬{:─<w_time$}┬{:─<w_keys$}┬{:─<w_plat$}┐",
        "",
        "",
        "",
        "",
        "",
        w_id = hash_width + 2,
        w_st = hash_width + 2,
        w_time = time_width + 2,
        w_keys = keys_width + 2,
        w_plat = platform_width + 2
    );
    println!(
        "│ {:^w_id$} │ {:^w_st$} │ {:^w_time$} │ {:^w_keys$} │ {:^w_plat$} │",
        "Identity",
        "Structure",
        "Captured (UTC)",
        "Keys",
        "Platform",
        w_id = hash_width,
        w_st = hash_width,
        w_time = time_width,
        w_keys = keys_width,
        w_plat = platform_width
    );
    println!(
        "├{:─<w_id$}┼{:─<w_st$}┼{:─<w_time$}┼{:─<w_keys$}┼{:─<w_plat$}┤",
        "",
        "",
        "",
        "",
        "",
        w_id = hash_width + 2,
        w_st = hash_width + 2,
        w_time = time_width + 2,
        w_keys = keys_width + 2,
        w_plat = platform_width + 2
    );

    for snapshot in snapshots {
        println!(
            "│ {:<w_id$} │ {:<w_st$} │ {:<w_time$} │ {:>w_keys$} │ {:<w_plat$} │",
            short(&snapshot.identity_hash, hash_width),
            short(&snapshot.structural_hash, hash_width),
            format_time(&snapshot.timestamp),
            snapshot.state.len(),
            snapshot.metadata.platform,
            w_id = hash_width,
            w_st = hash_width,
            w_time = time_width,
            w_keys = keys_width,
            w_plat = platform_width
        );
    }

    println!(
        "└{:─<w_id$}┴{:─<w_st$}┴{:─<w_time$}┴{:─<w_keys$}┴{:─<w_plat$}┘",
        "",
        "",
        "",
        "",
        "",
        w_id = hash_width + 2,
        w_st = hash_width + 2,
        w_time = time_width + 2,
        w_keys = keys_width + 2,
        w_plat = platform_width + 2
    );
    println!("{} snapshot(s)", snapshots.len());
}

pub fn display_snapshot_stats(stats: &SnapshotStats) {
    println!("Snapshot statistics");
    println!("  Snapshots:               {}", stats.snapshot_count);
    println!(
        "  Last snapshot:           {}",
        stats
            .last_snapshot_at
            .as_ref()
            .map(format_time)
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Preservation enabled:    {}", yes_no(stats.enabled));
    println!("  Persistence enabled:     {}", yes_no(stats.persistence_enabled));
    println!("  Storage used:            {}", format_bytes(stats.storage_bytes));
    println!("  Compatibility threshold: {:.2}", stats.compatibility_threshold);
    if stats.persistence_failures > 0 {
        println!("  Persistence failures:    {}", stats.persistence_failures);
    }
}

/// Summary printed when a connect session ends
pub fn display_diagnostics(diagnostics: &ClientDiagnostics) {
    println!("{}", "=".repeat(60));
    println!("{:^60}", "SESSION SUMMARY");
    println!("{}", "=".repeat(60));
    println!("Endpoint:            {}", diagnostics.endpoint);
    println!("Client ID:           {}", diagnostics.client_id);
    println!("Final state:         {}", diagnostics.state);
    let connection = &diagnostics.connection;
    println!("Connections:         {}", connection.successful_connections);
    println!("Reconnects:          {}", connection.reconnects_scheduled);
    println!(
        "Messages:            {} sent / {} received",
        connection.messages_sent, connection.messages_received
    );
    println!(
        "Heartbeats:          {} sent / {} acknowledged",
        connection.heartbeats_sent, connection.heartbeats_acknowledged
    );
    let recovery = &diagnostics.recovery;
    println!(
        "Network:             {} ({})",
        recovery.reachability, recovery.quality
    );
    println!("Errors recorded:     {}", recovery.total_errors);
    if let Some(current) = &recovery.current_error {
        println!("Unresolved error:    {} - {}", current.kind, current.message);
    }
    println!("Snapshots:           {}", diagnostics.snapshots.snapshot_count);
    println!("{}", "-".repeat(60));
}

/// One line per client event while connected
pub fn display_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => println!("✅ Connected"),
        ClientEvent::Disconnected(reason) => println!("🔌 Disconnected: {:?}", reason),
        ClientEvent::Message(envelope) => {
            println!("📨 {} message from {}", envelope.message_type, envelope.client_id)
        }
        ClientEvent::Error { presentation, .. } => println!("{}", presentation),
        ClientEvent::StateRestored { source, result } => println!(
            "♻️  Restored {} key(s) for {} ({} incompatible)",
            result.restored_keys.len(),
            source.descriptor.name,
            result.incompatible_keys.len()
        ),
        ClientEvent::RecoveryRetry(kind) => println!("🔁 Retrying after {}", kind),
        ClientEvent::StateChanged(state) => println!("   state: {}", state),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

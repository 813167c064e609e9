use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use goku::store::SnapshotRecord;

use super::session::short_id;
use super::{open, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// Archive the running container's workspace
    Capture {
        /// Label shown in listings (defaults to the capture time)
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List stored snapshots, newest first
    List {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Replace the sandbox with a container restored from a snapshot
    Restore { id: i64 },

    /// Delete a snapshot and its archive
    Delete { id: i64 },
}

pub async fn run(global: &GlobalArgs, action: SnapshotAction) -> Result<()> {
    let control = open(global).await?;

    match action {
        SnapshotAction::Capture { label } => {
            let record = control.capture_snapshot(label.as_deref()).await?;
            println!(
                "\n{} Captured snapshot #{} ({})",
                "✓".green(),
                record.id.to_string().cyan(),
                format_size(record.size_bytes)
            );
        }
        SnapshotAction::List { limit } => {
            let records = control.snapshots().list(limit)?;
            print!("{}", format_snapshot_list(&records));
        }
        SnapshotAction::Restore { id } => {
            println!("\n{} Restoring snapshot #{}...", "▶".yellow(), id);
            let container = control.restore_snapshot(id).await?;
            println!(
                "{} Container {} running.",
                "✓".green(),
                short_id(&container).cyan()
            );
        }
        SnapshotAction::Delete { id } => {
            control.delete_snapshot(id).await?;
            println!("\n{} Deleted snapshot #{}.", "✓".green(), id);
        }
    }

    Ok(())
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

pub fn format_snapshot_list(records: &[SnapshotRecord]) -> String {
    if records.is_empty() {
        return format!("\n{} No snapshots yet.\n", "ℹ".blue());
    }

    let mut out = format!("\n{}\n", "━".repeat(60).dimmed());
    for record in records {
        out.push_str(&format!(
            "  {:>4}  {}  {:<8}  {:>9}  {}\n",
            format!("#{}", record.id).cyan(),
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.agent.to_string(),
            format_size(record.size_bytes),
            record.label
        ));
    }
    out.push_str(&format!("{}\n", "━".repeat(60).dimmed()));
    out
}

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use tracing::warn;

use goku::store::{EventRecord, Iteration, VitalsRecord};
use goku::telemetry::{IngestOutcome, IterationReport, TelemetryBatch};

use super::{open, read_input, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum TelemetryAction {
    /// Ingest an event batch (JSON file, or `-` for stdin)
    Push { file: PathBuf },

    /// Record an iteration end report (JSON file, or `-` for stdin)
    End { file: PathBuf },

    /// List iterations, newest first
    Iterations {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Only iterations of the active or latest session
        #[arg(long)]
        current: bool,
    },

    /// Show one iteration with its events
    Show { id: i64 },

    /// Recent resource samples, newest first
    Vitals {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

pub async fn run(global: &GlobalArgs, action: TelemetryAction) -> Result<()> {
    let control = open(global).await?;
    let store = control.store();

    match action {
        TelemetryAction::Push { file } => {
            let batch = TelemetryBatch::from_json(&read_input(&file)?)?;
            let outcome = control.ingest(&batch)?;
            println!("{}", format_outcome(&outcome));
        }
        TelemetryAction::End { file } => {
            let report = IterationReport::from_json(&read_input(&file)?)?;
            let summarize = control.end_iteration(&report)?;
            if let Some(task) = summarize {
                if let Err(e) = task.await {
                    warn!("Summary task failed: {}", e);
                }
                store.flush()?;
            }
            println!(
                "{} Iteration {} ended.",
                "✓".green(),
                report.seq.to_string().cyan()
            );
        }
        TelemetryAction::Iterations {
            limit,
            offset,
            current,
        } => {
            let session = if current {
                store.active_or_latest_session()?.map(|s| s.id)
            } else {
                None
            };
            let iterations = store.list_iterations(limit, offset, session.as_deref())?;
            print!("{}", format_iterations(&iterations));
        }
        TelemetryAction::Show { id } => {
            let iteration = store
                .get_iteration(id)?
                .with_context(|| format!("Iteration {id} not found"))?;
            let events = store.events_for_iteration(id)?;
            print!("{}", format_iteration(&iteration, &events));
        }
        TelemetryAction::Vitals { limit } => {
            print!("{}", format_vitals(&store.list_vitals(limit)?));
        }
    }

    Ok(())
}

pub fn format_outcome(outcome: &IngestOutcome) -> String {
    format!(
        "{} Iteration {}: {} received, {} stored, {} duplicate(s)",
        "✓".green(),
        outcome.iteration_id.to_string().cyan(),
        outcome.received,
        outcome.persisted,
        outcome.duplicates
    )
}

fn iteration_line(iteration: &Iteration) -> String {
    let seq = iteration
        .seq
        .map(|s| format!("seq {s}"))
        .unwrap_or_else(|| "seq -".to_string());
    let state = if iteration.ended_at.is_some() {
        "done".green()
    } else {
        "open".yellow()
    };
    format!(
        "  {:>5}  {:<8}  {}  {}  {} actions, {} errors",
        format!("#{}", iteration.id).cyan(),
        seq,
        iteration.started_at.format("%Y-%m-%d %H:%M:%S"),
        state,
        iteration.action_count,
        iteration.error_count
    )
}

pub fn format_iterations(iterations: &[Iteration]) -> String {
    if iterations.is_empty() {
        return format!("\n{} No iterations recorded.\n", "ℹ".blue());
    }

    let mut out = format!("\n{}\n", "━".repeat(70).dimmed());
    for iteration in iterations {
        out.push_str(&iteration_line(iteration));
        out.push('\n');
        if let Some(summary) = &iteration.summary {
            out.push_str(&format!("         {}\n", summary.dimmed()));
        }
    }
    out.push_str(&format!("{}\n", "━".repeat(70).dimmed()));
    out
}

pub fn format_iteration(iteration: &Iteration, events: &[EventRecord]) -> String {
    let mut out = format!("\n{}\n", iteration_line(iteration));
    if let Some(summary) = &iteration.summary {
        out.push_str(&format!("  Summary: {}\n", summary));
    }
    out.push_str(&format!("{}\n", "━".repeat(70).dimmed()));
    for event in events {
        out.push_str(&format!(
            "  {}  {:<16}  {}\n",
            event.timestamp.format("%H:%M:%S").to_string().dimmed(),
            event.kind.cyan(),
            event.summary
        ));
    }
    if events.is_empty() {
        out.push_str(&format!("  {}\n", "no events".dimmed()));
    }
    out
}

pub fn format_vitals(samples: &[VitalsRecord]) -> String {
    if samples.is_empty() {
        return format!("\n{} No vitals recorded.\n", "ℹ".blue());
    }

    let mut out = format!("\n  {:<19}  {:>7}  {:>10}  {:>10}\n", "Time", "CPU", "Memory", "Disk");
    for sample in samples {
        out.push_str(&format!(
            "  {:<19}  {:>6.1}%  {:>7.1} MB  {:>7.1} MB\n",
            sample.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            sample.cpu_pct,
            sample.memory_mb,
            sample.disk_mb
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn iteration(id: i64, summary: Option<&str>, ended: bool) -> Iteration {
        Iteration {
            id,
            session_id: Some("c1".to_string()),
            seq: Some(3),
            started_at: Utc::now(),
            ended_at: ended.then(Utc::now),
            summary: summary.map(str::to_string),
            action_count: 4,
            error_count: 1,
        }
    }

    #[test]
    fn test_format_outcome() {
        let out = format_outcome(&IngestOutcome {
            iteration_id: 12,
            received: 3,
            persisted: 2,
            duplicates: 1,
        });
        assert!(out.contains("12"));
        assert!(out.contains("3 received, 2 stored, 1 duplicate(s)"));
    }

    #[test]
    fn test_format_iterations() {
        let out = format_iterations(&[
            iteration(2, None, false),
            iteration(1, Some("Added login form"), true),
        ]);
        assert!(out.contains("#2"));
        assert!(out.contains("seq 3"));
        assert!(out.contains("open"));
        assert!(out.contains("done"));
        assert!(out.contains("4 actions, 1 errors"));
        assert!(out.contains("Added login form"));

        assert!(format_iterations(&[]).contains("No iterations recorded"));
    }

    #[test]
    fn test_format_iteration_with_events() {
        let events = vec![EventRecord {
            id: 1,
            iteration_id: 1,
            timestamp: Utc::now(),
            kind: "tool_call".to_string(),
            summary: "read src/main.rs".to_string(),
            content: None,
        }];
        let out = format_iteration(&iteration(1, Some("Refactor"), true), &events);
        assert!(out.contains("Summary: Refactor"));
        assert!(out.contains("tool_call"));
        assert!(out.contains("read src/main.rs"));

        let empty = format_iteration(&iteration(1, None, false), &[]);
        assert!(empty.contains("no events"));
    }

    #[test]
    fn test_format_vitals() {
        let out = format_vitals(&[VitalsRecord {
            id: 1,
            timestamp: Utc::now(),
            cpu_pct: 12.5,
            memory_mb: 256.0,
            disk_mb: 1024.0,
        }]);
        assert!(out.contains("12.5%"));
        assert!(out.contains("256.0 MB"));
        assert!(out.contains("1024.0 MB"));
    }
}

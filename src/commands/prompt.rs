use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use goku::prompt::{PromptUpdate, Prompts};
use goku::store::PromptRecord;

use super::{open_store, read_input, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum PromptAction {
    /// Print the current task prompt
    Show,

    /// Save a new prompt version
    Set {
        /// Prompt text
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        content: Option<String>,

        /// Read the prompt from a file, or `-` for stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List saved versions, newest first
    History {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

pub fn run(global: &GlobalArgs, action: PromptAction) -> Result<()> {
    let config = global.load_config()?;
    let store = open_store(&config)?;
    let prompts = Prompts::new(store.clone());

    match action {
        PromptAction::Show => match prompts.latest()? {
            Some(record) => println!("{}", record.content),
            None => println!("{} No prompt set.", "ℹ".blue()),
        },
        PromptAction::Set { content, file } => {
            let content = match (content, file) {
                (Some(content), _) => content,
                (None, Some(file)) => String::from_utf8(read_input(&file)?)
                    .with_context(|| format!("{} is not valid UTF-8", file.display()))?,
                (None, None) => anyhow::bail!("Prompt content is required"),
            };
            let update = prompts.set(&content)?;
            store.flush()?;
            print!("{}", format_update(&update));
        }
        PromptAction::History { limit } => {
            print!("{}", format_history(&prompts.history(limit)?));
        }
    }

    Ok(())
}

pub fn format_update(update: &PromptUpdate) -> String {
    let previous = match &update.previous {
        Some(previous) => previous.as_str().dimmed().to_string(),
        None => "-".dimmed().to_string(),
    };
    format!(
        "{} Prompt saved.\n  {}:\n    {}\n  {}:\n    {}\n",
        "✓".green(),
        "Previous".yellow().bold(),
        previous,
        "Current".yellow().bold(),
        update.current
    )
}

pub fn format_history(records: &[PromptRecord]) -> String {
    if records.is_empty() {
        return format!("\n{} No prompt history.\n", "ℹ".blue());
    }

    let mut out = format!("\n{}\n", "━".repeat(70).dimmed());
    for record in records {
        let first_line = record.content.lines().next().unwrap_or_default();
        out.push_str(&format!(
            "  {:>5}  {}  {}\n",
            format!("#{}", record.id).cyan(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            first_line
        ));
    }
    out.push_str(&format!("{}\n", "━".repeat(70).dimmed()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_format_update_shows_both_versions() {
        colored::control::set_override(false);
        let out = format_update(&PromptUpdate {
            previous: Some("v1".to_string()),
            current: "v2".to_string(),
        });
        assert!(out.contains("Previous:\n    v1"));
        assert!(out.contains("Current:\n    v2"));
    }

    #[test]
    fn test_format_update_without_previous() {
        colored::control::set_override(false);
        let out = format_update(&PromptUpdate {
            previous: None,
            current: "first".to_string(),
        });
        assert!(out.contains("Previous:\n    -"));
    }

    #[test]
    fn test_format_history_uses_first_line() {
        let out = format_history(&[PromptRecord {
            id: 3,
            content: "Build a scraper\nwith retries".to_string(),
            updated_at: Utc::now(),
        }]);
        assert!(out.contains("#3"));
        assert!(out.contains("Build a scraper"));
        assert!(!out.contains("with retries"));
        assert!(format_history(&[]).contains("No prompt history"));
    }
}

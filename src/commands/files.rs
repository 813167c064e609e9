use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use goku::files::{EntryKind, FileEntry};

use super::snapshot::format_size;
use super::{open, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum FilesAction {
    /// List a workspace directory
    Ls {
        /// Directory inside the workspace (defaults to the workspace root)
        path: Option<String>,
    },

    /// Print a workspace file
    Cat { path: String },
}

pub async fn run(global: &GlobalArgs, action: FilesAction) -> Result<()> {
    let control = open(global).await?;

    match action {
        FilesAction::Ls { path } => {
            let entries = control.files().list(path.as_deref()).await?;
            print!("{}", format_listing(&entries));
        }
        FilesAction::Cat { path } => {
            let content = control.files().read(&path).await?;
            print!("{content}");
        }
    }

    Ok(())
}

pub fn format_listing(entries: &[FileEntry]) -> String {
    if entries.is_empty() {
        return format!("{}\n", "(empty)".dimmed());
    }

    let mut out = String::new();
    for entry in entries {
        let modified = entry
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        match entry.kind {
            EntryKind::Directory => out.push_str(&format!(
                "  {:>9}  {:<16}  {}/\n",
                "-",
                modified,
                entry.name.blue().bold()
            )),
            EntryKind::File => out.push_str(&format!(
                "  {:>9}  {:<16}  {}\n",
                format_size(entry.size),
                modified,
                entry.name
            )),
        }
    }
    out
}

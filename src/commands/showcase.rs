use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::io::Write;
use std::path::PathBuf;

use goku::preview::{LaunchOutcome, ManifestFile};

use super::{open, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum ShowcaseAction {
    /// Print the manifest the agent wrote
    Manifest,

    /// Launch the manifest's preview
    Launch,

    /// Fetch a workspace file served by a document or media preview
    Fetch {
        path: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn run(global: &GlobalArgs, action: ShowcaseAction) -> Result<()> {
    let control = open(global).await?;

    match action {
        ShowcaseAction::Manifest => match control.preview().read_manifest().await {
            Some(manifest) => print!("{}", format_manifest(&manifest)),
            None => println!("\n{} No showcase manifest found.", "ℹ".blue()),
        },
        ShowcaseAction::Launch => {
            let outcome = control.preview().launch().await?;
            print!("{}", format_launch(&outcome));
        }
        ShowcaseAction::Fetch { path, output } => {
            let file = control.preview().read_file(&path).await?;
            match output {
                Some(dest) => {
                    std::fs::write(&dest, &file.bytes)
                        .with_context(|| format!("Failed to write {}", dest.display()))?;
                    println!(
                        "{} Wrote {} ({}, {} bytes)",
                        "✓".green(),
                        dest.display(),
                        file.content_type,
                        file.bytes.len()
                    );
                }
                None => std::io::stdout()
                    .write_all(&file.bytes)
                    .context("Failed to write to stdout")?,
            }
        }
    }

    Ok(())
}

pub fn format_manifest(manifest: &ManifestFile) -> String {
    let mut out = format!("\n  Type:     {}\n", manifest.kind.cyan());
    if let Some(label) = &manifest.label {
        out.push_str(&format!("  Label:    {}\n", label));
    }
    if let Some(command) = &manifest.command {
        out.push_str(&format!("  Command:  {}\n", command.dimmed()));
    }
    if let Some(port) = manifest.port {
        out.push_str(&format!("  Port:     {}\n", port));
    }
    if let Some(path) = &manifest.path {
        out.push_str(&format!("  Path:     {}\n", path));
    }
    out
}

pub fn format_launch(outcome: &LaunchOutcome) -> String {
    match outcome {
        LaunchOutcome::Web { port, proxy_url } => format!(
            "\n{} Web preview listening on port {} (proxied at {})\n",
            "✓".green(),
            port.to_string().cyan(),
            proxy_url
        ),
        LaunchOutcome::Cli { output } => {
            format!("\n{} Command output:\n{}\n", "✓".green(), output.trim_end())
        }
        LaunchOutcome::Document { path } => {
            format!("\n{} Document preview: {}\n", "✓".green(), path.cyan())
        }
        LaunchOutcome::Media { path } => {
            format!("\n{} Media preview: {}\n", "✓".green(), path.cyan())
        }
    }
}

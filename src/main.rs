use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use goku::AgentVariant;

#[derive(Parser)]
#[command(name = "goku")]
#[command(
    author,
    version,
    about = "Control plane for a sandboxed coding-agent container"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: commands::GlobalArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sandbox with a fresh session (replaces a running one)
    Start {
        /// Agent runtime to run in the container
        #[arg(short, long, default_value = "opencode")]
        agent: AgentVariant,

        /// Extra container environment, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },

    /// Stop the sandbox and close the session
    Stop,

    /// Show sandbox, session and preview status
    Status,

    /// Follow the container logs until Ctrl-C
    Logs,

    /// Run a command inside the container
    Exec {
        /// Command line, split with shell quoting rules
        command: String,
    },

    /// Workspace snapshots
    Snapshot {
        #[command(subcommand)]
        action: commands::snapshot::SnapshotAction,
    },

    /// Browse the container workspace
    Files {
        #[command(subcommand)]
        action: commands::files::FilesAction,
    },

    /// Showcase previews
    Showcase {
        #[command(subcommand)]
        action: commands::showcase::ShowcaseAction,
    },

    /// Agent telemetry ingestion and history
    Telemetry {
        #[command(subcommand)]
        action: commands::telemetry::TelemetryAction,
    },

    /// Session mailbox
    Mailbox {
        #[command(subcommand)]
        action: commands::mailbox::MailboxAction,
    },

    /// Task prompt and its history
    Prompt {
        #[command(subcommand)]
        action: commands::prompt::PromptAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("goku=debug")
    } else {
        EnvFilter::new("goku=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let global = &cli.global;
    match cli.command {
        Commands::Start { agent, env } => {
            commands::session::start(global, agent, &env).await?;
        }
        Commands::Stop => {
            commands::session::stop(global).await?;
        }
        Commands::Status => {
            commands::session::status(global).await?;
        }
        Commands::Logs => {
            commands::logs::run(global).await?;
        }
        Commands::Exec { command } => {
            commands::exec::run(global, &command).await?;
        }
        Commands::Snapshot { action } => {
            commands::snapshot::run(global, action).await?;
        }
        Commands::Files { action } => {
            commands::files::run(global, action).await?;
        }
        Commands::Showcase { action } => {
            commands::showcase::run(global, action).await?;
        }
        Commands::Telemetry { action } => {
            commands::telemetry::run(global, action).await?;
        }
        Commands::Mailbox { action } => {
            commands::mailbox::run(global, action).await?;
        }
        Commands::Prompt { action } => {
            commands::prompt::run(global, action)?;
        }
    }

    Ok(())
}

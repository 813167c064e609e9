use anyhow::Result;
use colored::Colorize;
use tracing::info;

use goku::control::ControlStatus;
use goku::sandbox::SandboxState;
use goku::AgentVariant;

use super::{open, parse_env_pairs, GlobalArgs};

pub async fn start(global: &GlobalArgs, agent: AgentVariant, env: &[String]) -> Result<()> {
    let overrides = parse_env_pairs(env)?;
    let control = open(global).await?;

    println!(
        "\n{} Starting {} sandbox...",
        "▶".yellow(),
        agent.to_string().cyan()
    );
    let id = control.start_session(agent, &overrides).await?;
    info!("Session started in container {}", id);

    println!("{} Container {} running.", "✓".green(), short_id(&id).cyan());
    Ok(())
}

pub async fn stop(global: &GlobalArgs) -> Result<()> {
    let control = open(global).await?;
    control.stop_session().await?;
    println!("\n{} Sandbox stopped.", "✓".green());
    Ok(())
}

pub async fn status(global: &GlobalArgs) -> Result<()> {
    let control = open(global).await?;
    let status = control.status().await;
    print!("{}", format_status(&status));
    Ok(())
}

/// First 12 characters of a container id, as the engine CLI shows them.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

pub fn format_status(status: &ControlStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n{}\n", "━".repeat(50).dimmed()));
    out.push_str(&format!("{}\n", "   Goku Sandbox Status".yellow().bold()));
    out.push_str(&format!("{}\n", "━".repeat(50).dimmed()));

    let state = match status.sandbox.state {
        SandboxState::Running => "running".green().bold(),
        SandboxState::Stopped => "stopped".yellow(),
        SandboxState::NotRunning => "not running".red(),
    };
    out.push_str(&format!("  Sandbox:    {}\n", state));

    if let Some(id) = &status.sandbox.container_id {
        out.push_str(&format!("  Container:  {}\n", short_id(id).cyan()));
    }
    if let Some(agent) = status.sandbox.agent {
        out.push_str(&format!("  Agent:      {}\n", agent.to_string().cyan()));
    }

    match &status.session {
        Some(session) => {
            let label = if session.is_active() {
                "active".green()
            } else {
                "ended".dimmed()
            };
            out.push_str(&format!(
                "  Session:    {} ({})\n",
                short_id(&session.id).cyan(),
                label
            ));
            out.push_str(&format!(
                "  Started:    {}\n",
                session
                    .started_at
                    .format("%Y-%m-%d %H:%M:%S UTC")
                    .to_string()
                    .cyan()
            ));
            if let Some(stopped) = session.stopped_at {
                out.push_str(&format!(
                    "  Stopped:    {}\n",
                    stopped.format("%Y-%m-%d %H:%M:%S UTC").to_string().cyan()
                ));
            }
        }
        None => out.push_str(&format!("  Session:    {}\n", "none".dimmed())),
    }

    let preview = &status.preview;
    if preview.running {
        let kind = preview.kind.unwrap_or("unknown");
        let detail = match preview.port {
            Some(port) => format!("{kind} on port {port}"),
            None => kind.to_string(),
        };
        out.push_str(&format!("  Showcase:   {}\n", detail.cyan()));
        if let Some(label) = &preview.label {
            out.push_str(&format!("              {}\n", label.dimmed()));
        }
    } else {
        out.push_str(&format!("  Showcase:   {}\n", "idle".dimmed()));
    }

    out.push_str(&format!("{}\n", "━".repeat(50).dimmed()));
    out
}

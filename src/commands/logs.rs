use anyhow::Result;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{open, GlobalArgs};

/// Streams container logs to stdout until Ctrl-C or the container exits.
pub async fn run(global: &GlobalArgs) -> Result<()> {
    let control = open(global).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received, closing log stream");
            on_signal.cancel();
        }
    });

    let mut print_line = |line: &str| println!("{line}");
    control.follow_logs(&mut print_line, cancel.clone()).await?;

    if !cancel.is_cancelled() {
        println!("\n{} Log stream ended.", "ℹ".blue());
    }
    Ok(())
}

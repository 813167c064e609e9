use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use goku::mailbox::MailboxSide;
use goku::store::MailboxRecord;

use super::{open, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum MailboxAction {
    /// Show both sides of the active session's mailbox
    Show,

    /// Replace one side's message
    Post {
        #[arg(short, long, value_enum, default_value_t = MailboxSide::Human)]
        side: MailboxSide,

        message: String,
    },
}

pub async fn run(global: &GlobalArgs, action: MailboxAction) -> Result<()> {
    let control = open(global).await?;

    match action {
        MailboxAction::Show => {
            let record = control.mailbox().get()?;
            print!("{}", format_mailbox(&record));
        }
        MailboxAction::Post { side, message } => {
            control.mailbox().post(side, &message)?;
            control.store().flush()?;
            println!("{} Posted {} message.", "✓".green(), side.to_string().cyan());
        }
    }

    Ok(())
}

pub fn format_mailbox(record: &MailboxRecord) -> String {
    let side = |name: &str, msg: &Option<String>, at: &Option<chrono::DateTime<chrono::Utc>>| {
        let when = at
            .map(|t| format!(" ({})", t.format("%Y-%m-%d %H:%M")))
            .unwrap_or_default();
        match msg {
            Some(msg) => format!("  {}{}:\n    {}\n", name.yellow().bold(), when.dimmed(), msg),
            None => format!("  {}: {}\n", name.yellow().bold(), "-".dimmed()),
        }
    };

    let mut out = String::from("\n");
    out.push_str(&side("Agent", &record.agent_msg, &record.agent_updated_at));
    out.push_str(&side("Human", &record.human_msg, &record.human_updated_at));
    out
}

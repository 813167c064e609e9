use anyhow::{Context, Result};

use super::{open, GlobalArgs};

pub async fn run(global: &GlobalArgs, command: &str) -> Result<()> {
    let argv = split_command(command)?;
    let control = open(global).await?;
    let output = control.exec(&argv).await?;
    print!("{output}");
    Ok(())
}

/// Splits a command line with shell quoting rules.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(command)
        .with_context(|| format!("Failed to parse command: {command}"))?;
    anyhow::ensure!(!argv.is_empty(), "Command is empty");
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("git commit -m 'first pass'").unwrap(),
            vec!["git", "commit", "-m", "first pass"]
        );
        assert!(split_command("   ").is_err());
        assert!(split_command("echo 'unterminated").is_err());
    }
}

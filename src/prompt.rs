//! Operator confirmation capability.
//!
//! The reconciliation flow asks the operator before rewriting the managed
//! dataset list. Tests substitute a scripted implementation.

use std::io::{self, BufRead, Write};

/// Asks the operator yes/no questions on the controlling terminal.
pub trait OperatorPrompt: Send + Sync {
    /// Returns the operator's answer; `default_yes` is used on empty input.
    fn confirm(&self, message: &str, default_yes: bool) -> io::Result<bool>;
}

/// Reads answers from stdin.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    fn confirm(&self, message: &str, default_yes: bool) -> io::Result<bool> {
        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        print!("{message} {hint} ");
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;

        Ok(match line.trim().to_ascii_lowercase().as_str() {
            "" => default_yes,
            "y" | "yes" => true,
            _ => false,
        })
    }
}

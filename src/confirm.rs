//! Operator confirmation before high-risk runs.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

/// Asks the operator to approve a run.
pub trait Confirm {
    /// Returns `Ok(true)` only on explicit approval.
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Prompts on stderr and requires the answer `yes` on stdin.
#[derive(Debug, Default, Clone)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{}\nType 'yes' to continue: ", prompt).context("failed to write prompt")?;
        stderr.flush().context("failed to flush prompt")?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("failed to read confirmation")?;
        Ok(is_affirmative(&answer))
    }
}

fn is_affirmative(answer: &str) -> bool {
    answer.trim() == "yes"
}

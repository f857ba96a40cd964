//! Interactive confirmation before destructive actions.

use std::io::{self, BufRead, Write};

use parking_lot::Mutex;

/// Yes/no prompt.
#[cfg_attr(test, mockall::automock)]
pub trait Confirm: Send + Sync {
    /// Asks `question`; returns the answer.
    fn confirm(&self, question: &str) -> bool;
}

/// Terminal prompt with an optional fixed answer.
#[derive(Debug, Default)]
pub struct TerminalConfirm {
    /// When set, every question is answered with this value.
    auto_response: Option<bool>,
    /// Serializes prompts from concurrent workers.
    prompt: Mutex<()>,
}

impl TerminalConfirm {
    /// Creates a prompt; `auto_response` answers every question without
    /// asking.
    #[must_use]
    pub fn new(auto_response: Option<bool>) -> Self {
        Self {
            auto_response,
            prompt: Mutex::new(()),
        }
    }
}

impl Confirm for TerminalConfirm {
    #[allow(clippy::print_stdout)]
    fn confirm(&self, question: &str) -> bool {
        if let Some(answer) = self.auto_response {
            return answer;
        }

        let _guard = self.prompt.lock();
        print!("{question} [y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input).is_err() {
            return false;
        }
        parse_answer(&input)
    }
}

fn parse_answer(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

//! Terminal input shared by the REPL and the permission prompt.

use std::io::Write;

use async_trait::async_trait;
use policy::{PermissionRequest, UserDecision};
use runtime::Approver;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Line reader over stdin. Only one reader holds it at a time.
pub struct Input {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl Input {
    pub fn stdin() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    /// Print `prompt` to stderr and read one line. `None` at end of input.
    pub async fn read_line(&self, prompt: &str) -> std::io::Result<Option<String>> {
        let mut lines = self.lines.lock().await;
        let mut stderr = std::io::stderr();
        write!(stderr, "{prompt}")?;
        stderr.flush()?;
        lines.next_line().await
    }
}

/// Map an answer to a decision. Lowercase `n` rejects once, uppercase `N`
/// rejects for the session; an empty answer rejects once.
pub fn parse_answer(answer: &str) -> Option<UserDecision> {
    match answer.trim() {
        "y" | "Y" | "yes" => Some(UserDecision::once(true)),
        "a" | "A" | "always" => Some(UserDecision::always(true)),
        "" | "n" | "no" => Some(UserDecision::once(false)),
        "N" | "never" => Some(UserDecision::always(false)),
        _ => None,
    }
}

/// Asks the user on the terminal.
pub struct StdinApprover {
    input: std::sync::Arc<Input>,
}

impl StdinApprover {
    pub fn new(input: std::sync::Arc<Input>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl Approver for StdinApprover {
    async fn ask(&self, request: &PermissionRequest) -> UserDecision {
        let prompt = format!("\nAllow {request}? [y]es / [a]lways / [n]o / [N]ever: ");
        loop {
            match self.input.read_line(&prompt).await {
                Ok(Some(answer)) => match parse_answer(&answer) {
                    Some(decision) => return decision,
                    None => eprintln!("Please answer y, a, n or N."),
                },
                Ok(None) | Err(_) => return UserDecision::once(false),
            }
        }
    }
}

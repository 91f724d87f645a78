//! Terminal progress sink
//!
//! Renders [`ProgressUpdate`]s as an indicatif bar with one line per finished
//! step:
//!
//! ```text
//! ✅ [1/4] build succeeded
//! ❌ [2/4] push failed: registry 503
//! ⠋ [00:00:03] [################>-----------------------] 2/4 [3/4] deploy (eta 2s)
//! ```

use crate::cli::output::{create_progress_bar, format_duration, CHECK, CROSS};
use crate::core::RunContext;
use crate::progress::{ProgressSink, ProgressStatus, ProgressUpdate};
use async_trait::async_trait;
use console::style;
use indicatif::ProgressBar;

/// Sink that draws progress updates on the terminal
pub struct TerminalProgressSink {
    bar: ProgressBar,
}

impl TerminalProgressSink {
    pub fn new(total_steps: usize) -> Self {
        Self {
            bar: create_progress_bar(total_steps),
        }
    }

    /// Sink that tracks progress without drawing anything
    pub fn hidden(total_steps: usize) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(total_steps as u64);
        Self { bar }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Remove the bar once the run is over
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn header(update: &ProgressUpdate) -> String {
        format!("[{}/{}]", update.step, update.total)
    }
}

#[async_trait]
impl ProgressSink for TerminalProgressSink {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn send(&self, _ctx: &RunContext, update: &ProgressUpdate) -> anyhow::Result<()> {
        self.bar.set_length(update.total as u64);

        match update.status {
            ProgressStatus::Running => {
                self.bar.set_position(update.step.saturating_sub(1) as u64);
                let mut message = format!("{} {}", style(Self::header(update)).cyan(), update.message);
                if let Some(eta) = update.eta {
                    message.push_str(&format!(" {}", style(format!("(eta {})", format_duration(eta))).dim()));
                }
                self.bar.set_message(message);
            }
            ProgressStatus::Succeeded => {
                self.bar.set_position(update.step as u64);
                self.bar.println(format!(
                    "{}{} {}",
                    CHECK,
                    style(Self::header(update)).dim(),
                    style(&update.message).green()
                ));
            }
            ProgressStatus::Failed => {
                self.bar.println(format!(
                    "{}{} {}",
                    CROSS,
                    style(Self::header(update)).dim(),
                    style(&update.message).red()
                ));
            }
        }

        Ok(())
    }
}

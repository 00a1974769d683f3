use std::path::PathBuf;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ChoiceAnswer, CommandOutput, CommandRequest, History};
use crate::workflow::ChoiceOption;

/// Runs shell commands for run steps.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run one command to completion (or timeout).
    ///
    /// Failures to spawn are reported as a failed [`CommandOutput`], not as
    /// an error; `Err` is reserved for conditions the caller cannot recover.
    fn run(&self, request: CommandRequest) -> BoxFuture<'_, Result<CommandOutput>>;
}

/// Asks the user for input on behalf of choose and prompt steps.
pub trait Prompter: Send + Sync + 'static {
    fn choose(
        &self,
        message: &str,
        options: &[ChoiceOption],
    ) -> BoxFuture<'_, Result<ChoiceAnswer>>;

    fn text(&self, message: &str, default: Option<&str>) -> BoxFuture<'_, Result<String>>;
}

/// Receives the history of a finished (or aborted) run.
pub trait HistorySink: Send + Sync + 'static {
    /// Persist a run; returns where it was written, if anywhere.
    fn save(&self, history: History) -> BoxFuture<'_, Result<Option<PathBuf>>>;
}

/// A prompter for unattended runs. Every call fails.
pub struct NonInteractivePrompter;

impl Prompter for NonInteractivePrompter {
    fn choose(
        &self,
        message: &str,
        _options: &[ChoiceOption],
    ) -> BoxFuture<'_, Result<ChoiceAnswer>> {
        let message = message.to_string();
        Box::pin(async move {
            Err(crate::PipelinerError::Prompt(format!(
                "cannot ask \"{}\" without a terminal; set the variable through a profile",
                message
            )))
        })
    }

    fn text(&self, message: &str, _default: Option<&str>) -> BoxFuture<'_, Result<String>> {
        let message = message.to_string();
        Box::pin(async move {
            Err(crate::PipelinerError::Prompt(format!(
                "cannot ask \"{}\" without a terminal; set the variable through a profile",
                message
            )))
        })
    }
}

/// A history sink that drops everything.
pub struct NoHistory;

impl HistorySink for NoHistory {
    fn save(&self, _history: History) -> BoxFuture<'_, Result<Option<PathBuf>>> {
        Box::pin(async { Ok(None) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_interactive_prompter_refuses() {
        let prompter = NonInteractivePrompter;
        let err = prompter.text("Version?", Some("1.0")).await.unwrap_err();
        assert!(matches!(err, crate::PipelinerError::Prompt(_)));
        assert!(err.to_string().contains("Version?"));
    }
}

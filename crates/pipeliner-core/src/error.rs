use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelinerError {
    // Step errors
    #[error("Step {index}{} failed", line_suffix(.line))]
    StepFailed { index: usize, line: Option<usize> },

    #[error(
        "Step {index}{} completed, but workflow stopped due to continue: false",
        line_suffix(.line)
    )]
    StepStopped { index: usize, line: Option<usize> },

    #[error(
        "Step {index}{} timed out after {}s",
        line_suffix(.line),
        .timeout.as_secs_f64()
    )]
    StepTimedOut {
        index: usize,
        line: Option<usize>,
        timeout: Duration,
    },

    #[error("{0}")]
    Fail(String),

    #[error(
        "Parallel step {index}{} failed: one or more branches failed",
        line_suffix(.line)
    )]
    ParallelFailed { index: usize, line: Option<usize> },

    // Prompt errors
    #[error("Invalid choice result: {0}")]
    InvalidChoice(String),

    #[error("Prompt error: {0}")]
    Prompt(String),

    // Workflow file errors
    #[error("Workflow parse error: {0}")]
    WorkflowParse(String),

    #[error("Invalid workflow: {0}")]
    WorkflowValidation(String),

    #[error("Profile \"{name}\" not found. Available profiles: {available}")]
    ProfileNotFound { name: String, available: String },

    // Schedule errors
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Schedule error: {0}")]
    ScheduleConfig(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    // Daemon errors
    #[error("Scheduler daemon is already running (PID: {pid})")]
    DaemonAlreadyRunning { pid: u32 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelinerError {
    /// Whether this error ends a workflow because a step did not succeed
    /// (as opposed to a setup or collaborator failure).
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::StepFailed { .. }
                | Self::StepStopped { .. }
                | Self::StepTimedOut { .. }
                | Self::Fail(_)
                | Self::ParallelFailed { .. }
        )
    }
}

fn line_suffix(line: &Option<usize>) -> String {
    match line {
        Some(n) => format!(" (line {})", n),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, PipelinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_messages_include_line_when_known() {
        let err = PipelinerError::StepFailed {
            index: 2,
            line: Some(14),
        };
        assert_eq!(err.to_string(), "Step 2 (line 14) failed");

        let err = PipelinerError::StepStopped {
            index: 0,
            line: None,
        };
        assert_eq!(
            err.to_string(),
            "Step 0 completed, but workflow stopped due to continue: false"
        );
    }

    #[test]
    fn parallel_failure_names_group_index() {
        let err = PipelinerError::ParallelFailed {
            index: 3,
            line: None,
        };
        assert!(err.to_string().starts_with("Parallel step 3 failed"));
        assert!(err.is_step_failure());
        assert!(!PipelinerError::Prompt("no tty".into()).is_step_failure());
    }
}

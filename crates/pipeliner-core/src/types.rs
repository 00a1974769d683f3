use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-run options passed to the engine.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Variables set before the first step (profile values, CLI `--var`).
    pub vars: BTreeMap<String, String>,
}

impl ExecuteOptions {
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

/// A shell command to run for a step.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Shell prefix; the command is appended as the last argument.
    pub shell: Option<Vec<String>>,
    pub timeout: Option<Duration>,
    /// Step index the command belongs to, used to tag live output.
    pub step_index: usize,
    /// Stream output lines as they arrive.
    pub live: bool,
}

/// Result of one command invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: split_lines(stdout),
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stderr: split_lines(stderr),
            ..Default::default()
        }
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// Split text into lines, dropping a trailing blank partial line.
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    if lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceAnswer {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
}

/// One executed step (or parallel branch) as written to a history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<usize>,
    pub kind: String,
    pub label: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_value: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// A whole run as written to a history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub initial_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    pub records: Vec<StepRecord>,
}

/// A history file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub file_name: String,
    pub path: PathBuf,
}

/// Progress events published on the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Workflow run started.
    WorkflowStarted { name: Option<String>, steps: usize },
    /// A step is about to run.
    StepStarted {
        index: usize,
        kind: &'static str,
        label: String,
    },
    /// A step's `when` evaluated to false.
    StepSkipped { index: usize },
    /// A line of command output.
    OutputLine {
        index: usize,
        stream: OutputStream,
        line: String,
    },
    /// A failed attempt will be retried after a delay.
    RetryScheduled {
        index: usize,
        attempt: u32,
        delay_ms: u64,
    },
    /// An `onError` fallback command is starting.
    FallbackStarted { index: usize, command: String },
    /// A step (or branch) finished.
    StepCompleted {
        index: usize,
        status: StepStatus,
        duration_ms: u64,
    },
    /// Every branch of a parallel group was skipped.
    ParallelEmpty { index: usize },
    /// Workflow run finished.
    WorkflowCompleted { success: bool, elapsed_ms: u64 },
    /// A schedule's trigger was armed.
    ScheduleArmed { schedule_id: String, name: String },
    /// A schedule trigger fired. Not published for silent schedules.
    ScheduleFired { schedule_id: String, name: String },
    /// A scheduled run finished. `error` is set when it did not succeed.
    ScheduleFinished {
        schedule_id: String,
        name: String,
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_record_omits_empty_fields() {
        let record = StepRecord {
            step_index: 1,
            branch_index: None,
            kind: "run".into(),
            label: "echo hi".into(),
            status: StepStatus::Success,
            duration_ms: 12,
            resolved_command: Some("echo hi".into()),
            choice_value: None,
            prompt_value: None,
            stdout: "hi\n".into(),
            stderr: String::new(),
            line_number: Some(4),
            file_name: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["stepIndex"], 1);
        assert_eq!(json["status"], "success");
        assert_eq!(json["lineNumber"], 4);
        assert!(json.get("stderr").is_none());
        assert!(json.get("branchIndex").is_none());
    }

    #[test]
    fn split_lines_keeps_non_blank_tail() {
        assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines("a\r\nb"), vec!["a", "b"]);
        assert!(split_lines("").is_empty());
        assert_eq!(CommandOutput::ok("x\ny\n").stdout_text(), "x\ny");
    }

    #[test]
    fn execute_options_builder() {
        let opts = ExecuteOptions::default().with_var("env", "prod");
        assert_eq!(opts.vars.get("env").map(String::as_str), Some("prod"));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::capture::Capture;
use crate::condition::{scalar_to_string, Condition};
use crate::error::{PipelinerError, Result};

/// A complete workflow definition.
///
/// Produced from a YAML/JSON file by [`crate::loader::load_workflow`] or
/// deserialized directly in tests. The `line_numbers`, `file_name` and
/// `file_path` fields are filled by the loader, never read from the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,
    /// Working directory for commands, relative to the workflow file.
    #[serde(default)]
    pub base_dir: Option<String>,
    /// Global shell override, e.g. `["bash", "-lc"]`.
    #[serde(default)]
    pub shell: Option<Vec<String>>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    pub steps: Vec<Step>,
    #[serde(skip)]
    pub line_numbers: HashMap<usize, usize>,
    #[serde(skip)]
    pub file_name: Option<String>,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

impl Workflow {
    /// Look up a named profile.
    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PipelinerError::ProfileNotFound {
                name: name.to_string(),
                available: if self.profiles.is_empty() {
                    "(none defined in workflow)".to_string()
                } else {
                    self.profiles
                        .iter()
                        .map(|p| p.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                },
            })
    }

    /// Resolve the directory commands run in.
    ///
    /// An absolute `baseDir` is used as-is; a relative one is joined to the
    /// workflow file's directory (or the process directory when the workflow
    /// was not loaded from a file). Without `baseDir`, the workflow file's
    /// directory is used when known.
    pub fn resolved_base_dir(&self) -> Option<PathBuf> {
        let file_dir = self
            .file_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf());

        match self.base_dir.as_deref() {
            None => file_dir,
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if dir.is_absolute() {
                    Some(dir)
                } else if let Some(parent) = file_dir {
                    Some(parent.join(dir))
                } else {
                    std::env::current_dir().ok().map(|cwd| cwd.join(dir))
                }
            }
        }
    }
}

/// A named preset of variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(rename = "var", default, deserialize_with = "scalar_map")]
    pub vars: BTreeMap<String, String>,
}

/// One entry of a workflow's step list.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub when: Option<Condition>,
    pub kind: StepKind,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Run(RunStep),
    Choose(ChooseStep),
    Prompt(PromptStep),
    Parallel(ParallelStep),
    Fail(FailStep),
}

impl Step {
    /// Short name of the step variant, used in records and events.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Run(_) => "run",
            StepKind::Choose(_) => "choose",
            StepKind::Prompt(_) => "prompt",
            StepKind::Parallel(_) => "parallel",
            StepKind::Fail(_) => "fail",
        }
    }

    /// Human-readable label for the step.
    pub fn label(&self) -> String {
        match &self.kind {
            StepKind::Run(run) => run.command.trim().to_string(),
            StepKind::Choose(c) => format!("Choose: {}", c.message),
            StepKind::Prompt(p) => format!("Prompt: {}", p.message),
            StepKind::Parallel(p) => format!("Parallel ({} branches)", p.steps.len()),
            StepKind::Fail(f) => format!("Fail: {}", f.message),
        }
    }

    /// The `continue` flag, for the variants that carry one.
    pub fn continue_flag(&self) -> Option<bool> {
        match &self.kind {
            StepKind::Run(run) => run.continue_on,
            StepKind::Parallel(p) => p.continue_on,
            _ => None,
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self.kind, StepKind::Choose(_) | StepKind::Prompt(_))
    }
}

/// Shell command step.
#[derive(Debug, Clone)]
pub struct RunStep {
    pub command: String,
    /// Per-attempt timeout; fractional seconds in the file.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub shell: Option<Vec<String>>,
    pub continue_on: Option<bool>,
    pub on_error: Option<Box<RunChainNode>>,
    pub captures: Vec<Capture>,
}

/// A fallback command run when the command before it in the chain fails.
#[derive(Debug, Clone, Deserialize)]
pub struct RunChainNode {
    #[serde(rename = "run")]
    pub command: String,
    #[serde(default, deserialize_with = "positive_seconds")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(rename = "onError", default)]
    pub on_error: Option<Box<RunChainNode>>,
}

/// How many times a failed command is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRetry")]
pub enum RetryPolicy {
    Count(u32),
    Infinite,
}

impl RetryPolicy {
    /// Total tries allowed, `None` when unbounded.
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            Self::Count(n) => Some(n.saturating_add(1)),
            Self::Infinite => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRetry {
    Count(u32),
    Text(String),
}

impl TryFrom<RawRetry> for RetryPolicy {
    type Error = String;

    fn try_from(raw: RawRetry) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawRetry::Count(n) => Ok(Self::Count(n)),
            RawRetry::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "infinity" | "infinite" | "inf" => Ok(Self::Infinite),
                other => other
                    .parse::<u32>()
                    .map(Self::Count)
                    .map_err(|_| format!("invalid retry value '{}'", s)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
}

/// Multi-way user choice.
#[derive(Debug, Clone, Deserialize)]
pub struct ChooseStep {
    pub message: String,
    pub options: Vec<ChoiceOption>,
    /// Variable to store the chosen id in; defaults to the id itself.
    #[serde(rename = "as", default)]
    pub as_var: Option<String>,
}

/// Free-text user input.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptStep {
    pub message: String,
    #[serde(rename = "as")]
    pub as_var: String,
    #[serde(default)]
    pub default: Option<String>,
}

/// Concurrent fan-out of sub-steps.
#[derive(Debug, Clone)]
pub struct ParallelStep {
    pub steps: Vec<Step>,
    pub continue_on: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailStep {
    pub message: String,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    choose: Option<ChooseStep>,
    #[serde(default)]
    prompt: Option<PromptStep>,
    #[serde(default)]
    parallel: Option<Vec<Step>>,
    #[serde(default)]
    fail: Option<FailStep>,
    #[serde(default)]
    when: Option<Condition>,
    #[serde(default, deserialize_with = "positive_seconds")]
    timeout: Option<Duration>,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    shell: Option<Vec<String>>,
    #[serde(rename = "continue", default)]
    continue_on: Option<bool>,
    #[serde(rename = "onError", default)]
    on_error: Option<Box<RunChainNode>>,
    #[serde(default)]
    captures: Option<Vec<Capture>>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        let defined = [
            raw.run.is_some(),
            raw.choose.is_some(),
            raw.prompt.is_some(),
            raw.parallel.is_some(),
            raw.fail.is_some(),
        ]
        .iter()
        .filter(|d| **d)
        .count();

        if defined != 1 {
            return Err(format!(
                "step must define exactly one of run, choose, prompt, parallel, fail (found {})",
                defined
            ));
        }

        if let Some(shell) = &raw.shell {
            if shell.is_empty() {
                return Err("shell must have at least one element".to_string());
            }
        }

        let kind = if let Some(command) = raw.run {
            StepKind::Run(RunStep {
                command,
                timeout: raw.timeout,
                retry: raw.retry,
                shell: raw.shell,
                continue_on: raw.continue_on,
                on_error: raw.on_error,
                captures: raw.captures.unwrap_or_default(),
            })
        } else if let Some(choose) = raw.choose {
            StepKind::Choose(choose)
        } else if let Some(prompt) = raw.prompt {
            StepKind::Prompt(prompt)
        } else if let Some(steps) = raw.parallel {
            StepKind::Parallel(ParallelStep {
                steps,
                continue_on: raw.continue_on,
            })
        } else if let Some(fail) = raw.fail {
            StepKind::Fail(fail)
        } else {
            unreachable!("exactly one step kind checked above")
        };

        Ok(Step {
            when: raw.when,
            kind,
        })
    }
}

/// Deserialize a timeout in seconds. Fractions are allowed; zero, negative and
/// non-finite values are rejected.
fn positive_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(secs) = Option::<f64>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if !secs.is_finite() || secs <= 0.0 {
        return Err(serde::de::Error::custom(format!(
            "timeout must be a positive number of seconds, got {}",
            secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| serde::de::Error::custom(format!("invalid timeout {}: {}", secs, e)))
}

/// Deserialize a map whose values may be any YAML scalar, coercing to strings.
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            scalar_to_string(&v)
                .map(|s| (k.clone(), s))
                .ok_or_else(|| serde::de::Error::custom(format!("value for '{}' must be a scalar", k)))
        })
        .collect()
}

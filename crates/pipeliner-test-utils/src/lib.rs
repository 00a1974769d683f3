//! Shared mocks and fixtures for Pipeliner tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::future::BoxFuture;

use pipeliner_core::traits::{CommandRunner, HistorySink, Prompter};
use pipeliner_core::{
    ChoiceAnswer, ChoiceOption, CommandOutput, CommandRequest, History, PipelinerError, Result,
    Workflow,
};

#[derive(Debug, Clone)]
enum Script {
    Respond(String),
    FailAlways(i32),
    FailTimes(u32),
    TimeOut,
}

/// A command runner that never spawns anything.
///
/// Every command succeeds with empty output unless scripted otherwise. All
/// requests are recorded in order.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with the given stdout.
    pub fn respond(&self, command: &str, stdout: &str) {
        self.script(command, Script::Respond(stdout.to_string()));
    }

    /// Always exit with `code`.
    pub fn fail_always(&self, command: &str, code: i32) {
        self.script(command, Script::FailAlways(code));
    }

    /// Fail the first `times` invocations, then succeed.
    pub fn fail_times(&self, command: &str, times: u32) {
        self.script(command, Script::FailTimes(times));
    }

    /// Report a timeout on every invocation.
    pub fn time_out(&self, command: &str) {
        self.script(command, Script::TimeOut);
    }

    /// Commands in invocation order.
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn script(&self, command: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), script);
    }

    fn respond_to(&self, request: &CommandRequest) -> CommandOutput {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&request.command) {
            None => CommandOutput::ok(""),
            Some(Script::Respond(stdout)) => CommandOutput::ok(stdout),
            Some(Script::FailAlways(code)) => CommandOutput::failed(*code, "scripted failure"),
            Some(Script::FailTimes(remaining)) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    CommandOutput::failed(1, "scripted failure")
                } else {
                    CommandOutput::ok("")
                }
            }
            Some(Script::TimeOut) => {
                let secs = request.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                CommandOutput {
                    success: false,
                    exit_code: None,
                    stderr: vec![format!("Command timed out after {} seconds", secs)],
                    timed_out: true,
                    ..Default::default()
                }
            }
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: CommandRequest) -> BoxFuture<'_, Result<CommandOutput>> {
        Box::pin(async move {
            let output = self.respond_to(&request);
            self.requests.lock().unwrap().push(request);
            tokio::task::yield_now().await;
            Ok(output)
        })
    }
}

/// A prompter that answers from a queue.
#[derive(Default)]
pub struct ScriptedPrompter {
    choices: Mutex<VecDeque<String>>,
    texts: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the id returned by the next `choose` call.
    pub fn push_choice(&self, id: &str) -> &Self {
        self.choices.lock().unwrap().push_back(id.to_string());
        self
    }

    /// Queue the answer to the next `text` call.
    pub fn push_text(&self, answer: &str) -> &Self {
        self.texts.lock().unwrap().push_back(answer.to_string());
        self
    }

    /// Messages of every prompt shown so far.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn choose(
        &self,
        message: &str,
        options: &[ChoiceOption],
    ) -> BoxFuture<'_, Result<ChoiceAnswer>> {
        self.asked.lock().unwrap().push(message.to_string());
        let next = self.choices.lock().unwrap().pop_front();
        let label = next
            .as_ref()
            .and_then(|id| options.iter().find(|o| &o.id == id))
            .map(|o| o.label.clone())
            .unwrap_or_default();
        Box::pin(async move {
            let id = next.ok_or_else(|| PipelinerError::Prompt("no scripted choice".into()))?;
            Ok(ChoiceAnswer { id, label })
        })
    }

    fn text(&self, message: &str, default: Option<&str>) -> BoxFuture<'_, Result<String>> {
        self.asked.lock().unwrap().push(message.to_string());
        let answer = self
            .texts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| default.map(String::from));
        Box::pin(async move {
            answer.ok_or_else(|| PipelinerError::Prompt("no scripted answer".into()))
        })
    }
}

/// A history sink that keeps everything in memory.
#[derive(Default)]
pub struct MemoryHistory {
    saved: Mutex<Vec<History>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<History> {
        self.saved.lock().unwrap().clone()
    }

    /// The most recently saved run.
    pub fn last(&self) -> Option<History> {
        self.saved.lock().unwrap().last().cloned()
    }
}

impl HistorySink for MemoryHistory {
    fn save(&self, history: History) -> BoxFuture<'_, Result<Option<PathBuf>>> {
        self.saved.lock().unwrap().push(history);
        Box::pin(async { Ok(None) })
    }
}

/// Parse a workflow from YAML, panicking on invalid input.
pub fn workflow(yaml: &str) -> Workflow {
    pipeliner_core::loader::parse_yaml(yaml).expect("test workflow should parse")
}

/// Write `content` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// A temp directory laid out like `~/.pipeliner`.
pub fn temp_home() -> (tempfile::TempDir, pipeliner_core::ResolvedPaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = pipeliner_core::ResolvedPaths::under(dir.path());
    (dir, paths)
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use pipeliner_core::config::EngineConfig;
use pipeliner_core::traits::CommandRunner;
use pipeliner_core::{
    CommandOutput, CommandRequest, EngineEvent, EventBus, Result, RetryPolicy, RunChainNode,
    RunStep,
};

use crate::capture::parse_capture;
use crate::template::substitute;
use crate::workspace::Workspace;

/// Exponential backoff between retries: `initial * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
        }
    }
}

impl From<&EngineConfig> for BackoffPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Where and how a run step executes.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Index the result is stored under (synthetic for parallel branches).
    pub step_index: usize,
    pub cwd: Option<PathBuf>,
    pub global_shell: Option<Vec<String>>,
    /// Stream output live instead of only buffering it.
    pub live: bool,
}

/// What happened to the main command of a run step.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub timed_out: bool,
    /// Command after template substitution.
    pub command: String,
    pub attempts: u32,
    /// Output of the final attempt.
    pub output: CommandOutput,
    /// Set when an `onError` chain ran: whether any fallback succeeded.
    pub fallback_succeeded: Option<bool>,
}

/// Executes run steps: substitution, retries with backoff, per-attempt
/// timeout, captures and the `onError` fallback chain.
#[derive(Clone)]
pub struct RunStepRunner {
    commands: Arc<dyn CommandRunner>,
    backoff: BackoffPolicy,
    events: EventBus,
}

impl RunStepRunner {
    pub fn new(commands: Arc<dyn CommandRunner>, backoff: BackoffPolicy, events: EventBus) -> Self {
        Self {
            commands,
            backoff,
            events,
        }
    }

    /// Run a step against `workspace`.
    ///
    /// The step's success is stored under `ctx.step_index` and is decided by
    /// the main command alone; fallbacks only run for their side effects.
    pub async fn run(
        &self,
        step: &RunStep,
        workspace: &mut Workspace,
        ctx: &RunContext,
    ) -> Result<RunOutcome> {
        let command = substitute(step.command.trim(), workspace);
        let shell = step.shell.clone().or_else(|| ctx.global_shell.clone());

        let mut outcome = self
            .run_with_retry(&command, step.timeout, step.retry, shell, ctx)
            .await?;
        workspace.set_step_result(ctx.step_index, outcome.success);

        for capture in &step.captures {
            let Some(name) = &capture.as_var else {
                continue;
            };
            match parse_capture(&capture.strategy, &outcome.output.stdout) {
                Some(value) => {
                    debug!(variable = %name, "Captured value");
                    workspace.set_variable(name.clone(), value);
                }
                None => debug!(variable = %name, "Capture did not match"),
            }
        }

        if !outcome.success {
            if let Some(first) = step.on_error.as_deref() {
                outcome.fallback_succeeded = Some(self.run_fallbacks(first, workspace, ctx).await?);
            }
        }

        Ok(outcome)
    }

    /// Walk the fallback chain until one node succeeds.
    async fn run_fallbacks(
        &self,
        first: &RunChainNode,
        workspace: &Workspace,
        ctx: &RunContext,
    ) -> Result<bool> {
        let mut node = Some(first);
        while let Some(current) = node {
            let command = substitute(current.command.trim(), workspace);
            info!(step = ctx.step_index, command = %command, "Running onError fallback");
            self.events.publish(EngineEvent::FallbackStarted {
                index: ctx.step_index,
                command: command.clone(),
            });

            let outcome = self
                .run_with_retry(
                    &command,
                    current.timeout,
                    current.retry,
                    ctx.global_shell.clone(),
                    ctx,
                )
                .await?;
            if outcome.success {
                return Ok(true);
            }
            node = current.on_error.as_deref();
        }
        Ok(false)
    }

    async fn run_with_retry(
        &self,
        command: &str,
        timeout: Option<Duration>,
        retry: Option<RetryPolicy>,
        shell: Option<Vec<String>>,
        ctx: &RunContext,
    ) -> Result<RunOutcome> {
        let max_attempts = retry.unwrap_or(RetryPolicy::Count(0)).max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            let output = self
                .commands
                .run(CommandRequest {
                    command: command.to_string(),
                    cwd: ctx.cwd.clone(),
                    shell: shell.clone(),
                    timeout,
                    step_index: ctx.step_index,
                    live: ctx.live,
                })
                .await?;

            let exhausted = max_attempts.is_some_and(|max| attempt >= max);
            if output.success || exhausted {
                return Ok(RunOutcome {
                    success: output.success,
                    timed_out: output.timed_out,
                    command: command.to_string(),
                    attempts: attempt,
                    output,
                    fallback_succeeded: None,
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                step = ctx.step_index,
                attempt,
                max_attempts = ?max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Command failed, retrying"
            );
            self.events.publish(EngineEvent::RetryScheduled {
                index: ctx.step_index,
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeliner_core::StepKind;
    use pipeliner_test_utils::ScriptedRunner;

    fn run_step(yaml: &str) -> RunStep {
        let step: pipeliner_core::Step = serde_yaml::from_str(yaml).unwrap();
        match step.kind {
            StepKind::Run(run) => run,
            other => panic!("expected run step, got {:?}", other),
        }
    }

    fn runner(scripted: &Arc<ScriptedRunner>) -> RunStepRunner {
        RunStepRunner::new(scripted.clone(), BackoffPolicy::default(), EventBus::default())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(8000));
        assert_eq!(policy.delay(5), Duration::from_millis(10_000));
        assert_eq!(policy.delay(60), Duration::from_millis(10_000));

        let configured = BackoffPolicy::from(&EngineConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 30,
            record_history: false,
        });
        assert_eq!(configured.delay(3), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_runs_n_plus_one_times() {
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.fail_always("flaky", 1);
        let step = run_step("run: flaky\nretry: 3\n");
        let mut ws = Workspace::new();

        let outcome = runner(&scripted)
            .run(&step, &mut ws, &RunContext::default())
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(scripted.commands(), vec!["flaky"; 4]);
        assert_eq!(ws.step_result(0), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_runs_once() {
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.fail_always("broken", 2);
        let step = run_step("run: broken\n");
        let outcome = runner(&scripted)
            .run(&step, &mut Workspace::new(), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(scripted.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_retry_stops_on_success() {
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.fail_times("eventually", 5);
        let step = run_step("run: eventually\nretry: Infinity\n");
        let outcome = runner(&scripted)
            .run(&step, &mut Workspace::new(), &RunContext::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_success_does_not_change_step_result() {
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.fail_always("main", 1);
        scripted.fail_always("first-fallback", 1);
        let step = run_step(
            "run: main\nonError:\n  run: first-fallback\n  onError:\n    run: second-fallback\n",
        );
        let mut ws = Workspace::new();
        let ctx = RunContext {
            step_index: 2,
            ..Default::default()
        };

        let outcome = runner(&scripted).run(&step, &mut ws, &ctx).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.fallback_succeeded, Some(true));
        assert_eq!(ws.step_result(2), Some(false));
        assert_eq!(
            scripted.commands(),
            vec!["main", "first-fallback", "second-fallback"]
        );
    }

    #[tokio::test]
    async fn captures_write_variables_and_substitute() {
        let scripted = Arc::new(ScriptedRunner::new());
        scripted.respond("echo build", "VERSION=2.1\nsha: abc123");
        let step = run_step(
            r#"
run: echo {{ target }}
captures:
  - kv: VERSION
    as: version
  - regex: "sha: (\\w+)"
    as: sha
  - regex: "nothing (here)"
    as: absent
"#,
        );
        let mut ws = Workspace::new();
        ws.set_variable("target", "build");

        let outcome = runner(&scripted)
            .run(&step, &mut ws, &RunContext::default())
            .await
            .unwrap();

        assert_eq!(outcome.command, "echo build");
        assert_eq!(ws.variable("version"), Some("2.1"));
        assert_eq!(ws.variable("sha"), Some("abc123"));
        assert!(!ws.has_variable("absent"));
    }

    #[tokio::test]
    async fn step_shell_overrides_global_shell() {
        let scripted = Arc::new(ScriptedRunner::new());
        let step = run_step("run: ls\nshell: [bash, -lc]\n");
        let ctx = RunContext {
            global_shell: Some(vec!["zsh".into(), "-c".into()]),
            ..Default::default()
        };
        runner(&scripted)
            .run(&step, &mut Workspace::new(), &ctx)
            .await
            .unwrap();
        let requests = scripted.requests();
        assert_eq!(
            requests[0].shell.as_deref(),
            Some(&["bash".to_string(), "-lc".to_string()][..])
        );
    }
}

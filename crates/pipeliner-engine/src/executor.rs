use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use pipeliner_core::traits::{CommandRunner, HistorySink, NoHistory, Prompter};
use pipeliner_core::{
    ChooseStep, EngineEvent, EventBus, ExecuteOptions, History, PipelinerError, PromptStep,
    Result, Step, StepKind, StepRecord, StepStatus, Workflow,
};

use crate::condition::ConditionEvaluator;
use crate::history::Recorder;
use crate::parallel::run_parallel;
use crate::runner::{BackoffPolicy, RunContext, RunStepRunner};
use crate::template::substitute;
use crate::workspace::Workspace;

/// Position of a step being executed.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Top-level index, or `parent * 1000 + branch` inside a parallel group.
    pub step_index: usize,
    pub branch_index: Option<usize>,
    pub line_number: Option<usize>,
    /// Stream command output live (top level) or buffer it (branches).
    pub live: bool,
}

/// Result of a step that ran without raising.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub resolved_command: Option<String>,
    pub choice_value: Option<String>,
    pub prompt_value: Option<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl StepOutcome {
    fn succeeded() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }
}

/// Executes single steps. Cheap to clone; parallel branches each get a copy.
#[derive(Clone)]
pub struct StepDispatcher {
    runner: RunStepRunner,
    prompter: Arc<dyn Prompter>,
    events: EventBus,
    recorder: Recorder,
    cwd: Option<PathBuf>,
    global_shell: Option<Vec<String>>,
    file_name: Option<String>,
}

impl StepDispatcher {
    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Evaluate `when`, then run the step. `None` means skipped.
    pub async fn execute_step(
        &self,
        step: &Step,
        workspace: &mut Workspace,
        ctx: &StepContext,
    ) -> Result<Option<StepOutcome>> {
        if let Some(condition) = &step.when {
            if !ConditionEvaluator::new(workspace).evaluate(condition) {
                debug!(step = ctx.step_index, "Condition not met, skipping step");
                self.events.publish(EngineEvent::StepSkipped {
                    index: ctx.step_index,
                });
                return Ok(None);
            }
        }
        self.run_step(step, workspace, ctx).await.map(Some)
    }

    /// Run a step unconditionally and record it.
    ///
    /// Parallel groups are not recorded themselves; their branches are.
    pub fn run_step<'a>(
        &'a self,
        step: &'a Step,
        workspace: &'a mut Workspace,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepOutcome>> {
        Box::pin(async move {
            let label = step.label();
            self.events.publish(EngineEvent::StepStarted {
                index: ctx.step_index,
                kind: step.kind_name(),
                label: label.clone(),
            });
            let started = Instant::now();

            let result = self.dispatch(step, workspace, ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let status = match &result {
                Ok(outcome) if outcome.success => StepStatus::Success,
                _ => StepStatus::Failure,
            };
            self.events.publish(EngineEvent::StepCompleted {
                index: ctx.step_index,
                status,
                duration_ms,
            });

            if !matches!(step.kind, StepKind::Parallel(_)) {
                let record = match &result {
                    Ok(outcome) => self.build_record(step, ctx, label, status, duration_ms, outcome),
                    Err(e) => {
                        let failed = StepOutcome {
                            stderr: vec![e.to_string()],
                            ..Default::default()
                        };
                        self.build_record(step, ctx, label, status, duration_ms, &failed)
                    }
                };
                self.recorder.record(record);
            }
            result
        })
    }

    async fn dispatch(
        &self,
        step: &Step,
        workspace: &mut Workspace,
        ctx: &StepContext,
    ) -> Result<StepOutcome> {
        match &step.kind {
            StepKind::Run(run) => {
                let run_ctx = RunContext {
                    step_index: ctx.step_index,
                    cwd: self.cwd.clone(),
                    global_shell: self.global_shell.clone(),
                    live: ctx.live,
                };
                let outcome = self.runner.run(run, workspace, &run_ctx).await?;
                if !outcome.success {
                    warn!(
                        step = ctx.step_index,
                        command = %outcome.command,
                        exit_code = ?outcome.output.exit_code,
                        timed_out = outcome.timed_out,
                        "Run step failed"
                    );
                }
                Ok(StepOutcome {
                    success: outcome.success,
                    timed_out: outcome.timed_out,
                    resolved_command: Some(outcome.command),
                    stdout: outcome.output.stdout,
                    stderr: outcome.output.stderr,
                    ..Default::default()
                })
            }
            StepKind::Choose(choose) => self.choose(choose, workspace, ctx).await,
            StepKind::Prompt(prompt) => self.prompt(prompt, workspace, ctx).await,
            StepKind::Parallel(group) => {
                let success = run_parallel(self, group, workspace, ctx).await;
                Ok(StepOutcome {
                    success,
                    ..Default::default()
                })
            }
            StepKind::Fail(fail) => {
                info!(step = ctx.step_index, message = %fail.message, "Fail step reached");
                Err(PipelinerError::Fail(fail.message.clone()))
            }
        }
    }

    async fn choose(
        &self,
        step: &ChooseStep,
        workspace: &mut Workspace,
        ctx: &StepContext,
    ) -> Result<StepOutcome> {
        if let Some(var) = &step.as_var {
            if let Some(preset) = workspace.variable(var) {
                if step.options.iter().any(|o| o.id == preset) {
                    let preset = preset.to_string();
                    debug!(step = ctx.step_index, variable = %var, value = %preset, "Using preset choice");
                    workspace.set_choice(preset.clone());
                    workspace.set_step_result(ctx.step_index, true);
                    return Ok(StepOutcome {
                        choice_value: Some(preset),
                        ..StepOutcome::succeeded()
                    });
                }
            }
        }

        let answer = self.prompter.choose(&step.message, &step.options).await?;
        if answer.id.is_empty() {
            return Err(PipelinerError::InvalidChoice(format!(
                "{{ id: \"\", label: \"{}\" }}",
                answer.label
            )));
        }

        let target = step.as_var.clone().unwrap_or_else(|| answer.id.clone());
        workspace.set_choice(answer.id.clone());
        workspace.set_variable(target, answer.id.clone());
        workspace.set_step_result(ctx.step_index, true);
        Ok(StepOutcome {
            choice_value: Some(answer.id),
            ..StepOutcome::succeeded()
        })
    }

    async fn prompt(
        &self,
        step: &PromptStep,
        workspace: &mut Workspace,
        ctx: &StepContext,
    ) -> Result<StepOutcome> {
        let value = match workspace.variable(&step.as_var) {
            Some(preset) => {
                debug!(step = ctx.step_index, variable = %step.as_var, "Using preset prompt value");
                preset.to_string()
            }
            None => {
                let message = substitute(&step.message, workspace);
                let default = step.default.as_deref().map(|d| substitute(d, workspace));
                let value = self.prompter.text(&message, default.as_deref()).await?;
                workspace.set_variable(step.as_var.clone(), value.clone());
                value
            }
        };
        workspace.set_fact(step.as_var.clone(), value.clone());
        workspace.set_step_result(ctx.step_index, true);
        Ok(StepOutcome {
            prompt_value: Some(value),
            ..StepOutcome::succeeded()
        })
    }

    fn build_record(
        &self,
        step: &Step,
        ctx: &StepContext,
        label: String,
        status: StepStatus,
        duration_ms: u64,
        outcome: &StepOutcome,
    ) -> StepRecord {
        StepRecord {
            step_index: ctx.step_index,
            branch_index: ctx.branch_index,
            kind: step.kind_name().to_string(),
            label,
            status,
            duration_ms,
            resolved_command: outcome.resolved_command.clone(),
            choice_value: outcome.choice_value.clone(),
            prompt_value: outcome.prompt_value.clone(),
            stdout: outcome.stdout.join("\n"),
            stderr: outcome.stderr.join("\n"),
            line_number: ctx.line_number,
            file_name: self.file_name.clone(),
        }
    }
}

/// Decide whether the workflow may go on after a step.
///
/// `continue: true` never stops, `continue: false` always stops, and without
/// the flag only a failure stops.
fn continue_policy(step: &Step, ctx: &StepContext, outcome: &StepOutcome) -> Result<()> {
    let failure = || match &step.kind {
        StepKind::Parallel(_) => PipelinerError::ParallelFailed {
            index: ctx.step_index,
            line: ctx.line_number,
        },
        StepKind::Run(run) if outcome.timed_out => PipelinerError::StepTimedOut {
            index: ctx.step_index,
            line: ctx.line_number,
            timeout: run.timeout.unwrap_or_default(),
        },
        _ => PipelinerError::StepFailed {
            index: ctx.step_index,
            line: ctx.line_number,
        },
    };

    match (step.continue_flag(), outcome.success) {
        (Some(true), false) => {
            warn!(step = ctx.step_index, "Step failed, continuing (continue: true)");
            Ok(())
        }
        (Some(true), true) | (None, true) => Ok(()),
        (Some(false), true) => Err(PipelinerError::StepStopped {
            index: ctx.step_index,
            line: ctx.line_number,
        }),
        (Some(false), false) | (None, false) => Err(failure()),
    }
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct ExecutionReport {
    pub workspace: Workspace,
    pub history: History,
    pub history_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Runs whole workflows.
pub struct Engine {
    commands: Arc<dyn CommandRunner>,
    prompter: Arc<dyn Prompter>,
    history: Arc<dyn HistorySink>,
    backoff: BackoffPolicy,
    events: EventBus,
}

impl Engine {
    pub fn new(commands: Arc<dyn CommandRunner>, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            commands,
            prompter,
            history: Arc::new(NoHistory),
            backoff: BackoffPolicy::default(),
            events: EventBus::default(),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run every step in order.
    ///
    /// History is handed to the sink whether the run finishes or aborts; an
    /// aborting step's error is returned after that.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        options: ExecuteOptions,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        let mut workspace = Workspace::new();
        for (name, value) in options.vars {
            workspace.set_variable(name, value);
        }

        let recorder = Recorder::new(workflow.name.clone());
        let dispatcher = StepDispatcher {
            runner: RunStepRunner::new(self.commands.clone(), self.backoff, self.events.clone()),
            prompter: self.prompter.clone(),
            events: self.events.clone(),
            recorder: recorder.clone(),
            cwd: workflow.resolved_base_dir(),
            global_shell: workflow.shell.clone(),
            file_name: workflow.file_name.clone(),
        };

        info!(
            workflow = workflow.name.as_deref().unwrap_or("(unnamed)"),
            steps = workflow.steps.len(),
            "Starting workflow"
        );
        self.events.publish(EngineEvent::WorkflowStarted {
            name: workflow.name.clone(),
            steps: workflow.steps.len(),
        });

        let result = run_steps(&dispatcher, workflow, &mut workspace).await;
        let elapsed = started.elapsed();

        self.events.publish(EngineEvent::WorkflowCompleted {
            success: result.is_ok(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        let history = recorder.snapshot();
        let history_path = match self.history.save(history.clone()).await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Failed to save workflow history");
                None
            }
        };

        match result {
            Ok(()) => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "Workflow completed");
                Ok(ExecutionReport {
                    workspace,
                    history,
                    history_path,
                    elapsed,
                })
            }
            Err(e) => {
                error!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "Workflow aborted");
                Err(e)
            }
        }
    }
}

async fn run_steps(
    dispatcher: &StepDispatcher,
    workflow: &Workflow,
    workspace: &mut Workspace,
) -> Result<()> {
    for (index, step) in workflow.steps.iter().enumerate() {
        let ctx = StepContext {
            step_index: index,
            branch_index: None,
            line_number: workflow.line_numbers.get(&index).copied(),
            live: true,
        };
        let Some(outcome) = dispatcher.execute_step(step, workspace, &ctx).await? else {
            continue;
        };
        continue_policy(step, &ctx, &outcome)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeliner_test_utils::{workflow, MemoryHistory, ScriptedPrompter, ScriptedRunner};

    fn engine(
        runner: &Arc<ScriptedRunner>,
        prompter: &Arc<ScriptedPrompter>,
        history: &Arc<MemoryHistory>,
    ) -> Engine {
        Engine::new(runner.clone(), prompter.clone()).with_history(history.clone())
    }

    struct Harness {
        runner: Arc<ScriptedRunner>,
        prompter: Arc<ScriptedPrompter>,
        history: Arc<MemoryHistory>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                runner: Arc::new(ScriptedRunner::new()),
                prompter: Arc::new(ScriptedPrompter::new()),
                history: Arc::new(MemoryHistory::new()),
            }
        }

        async fn run(&self, yaml: &str) -> Result<ExecutionReport> {
            self.run_with(yaml, ExecuteOptions::default()).await
        }

        async fn run_with(&self, yaml: &str, options: ExecuteOptions) -> Result<ExecutionReport> {
            engine(&self.runner, &self.prompter, &self.history)
                .execute(&workflow(yaml), options)
                .await
        }
    }

    #[tokio::test]
    async fn continue_matrix() {
        // (continue flag, command fails, expect abort)
        let cases = [
            ("continue: false", false, true),
            ("continue: false", true, true),
            ("continue: true", true, false),
            ("", true, true),
            ("", false, false),
        ];
        for (flag, fails, aborts) in cases {
            let h = Harness::new();
            if fails {
                h.runner.fail_always("first", 1);
            }
            let yaml = format!("steps:\n  - run: first\n    {}\n  - run: second\n", flag);
            let result = h.run(&yaml).await;
            assert_eq!(result.is_err(), aborts, "case {:?} fails={}", flag, fails);
            let expected: Vec<&str> = if aborts {
                vec!["first"]
            } else {
                vec!["first", "second"]
            };
            assert_eq!(h.runner.commands(), expected, "case {:?} fails={}", flag, fails);
        }
    }

    #[tokio::test]
    async fn forced_stop_after_success_has_distinct_error() {
        let h = Harness::new();
        let err = h
            .run("steps:\n  - run: ok\n    continue: false\n  - run: never\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelinerError::StepStopped { index: 0, .. }));
    }

    #[tokio::test]
    async fn timeout_failure_reports_timeout() {
        let h = Harness::new();
        h.runner.time_out("slow");
        let err = h
            .run("steps:\n  - run: slow\n    timeout: 2\n")
            .await
            .unwrap_err();
        match err {
            PipelinerError::StepTimedOut { index, timeout, .. } => {
                assert_eq!(index, 0);
                assert_eq!(timeout, Duration::from_secs(2));
            }
            other => panic!("expected timeout error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_applies_to_every_retry_attempt() {
        let h = Harness::new();
        h.runner.time_out("slow");
        let err = h
            .run("steps:\n  - run: slow\n    timeout: 2\n    retry: 2\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelinerError::StepTimedOut { index: 0, .. }));

        let requests = h.runner.requests();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            assert_eq!(request.timeout, Some(Duration::from_secs(2)));
        }
    }

    #[tokio::test]
    async fn fractional_timeout_reaches_the_command() {
        let h = Harness::new();
        h.runner.time_out("slow");
        let err = h
            .run("steps:\n  - run: slow\n    timeout: 1.5\n")
            .await
            .unwrap_err();
        assert_eq!(
            h.runner.requests()[0].timeout,
            Some(Duration::from_millis(1500))
        );
        let message = err.to_string();
        assert!(message.starts_with("Step 0"), "{}", message);
        assert!(message.ends_with("timed out after 1.5s"), "{}", message);
    }

    #[tokio::test]
    async fn choose_then_conditional_steps() {
        let h = Harness::new();
        h.prompter.push_choice("staging");
        let report = h
            .run(
                r#"
steps:
  - run: echo A
  - choose:
      message: Target?
      options:
        - { id: staging, label: Staging }
        - { id: prod, label: Production }
      as: env
  - run: deploy
    when: { var: { env: staging } }
  - run: deploy-prod
    when: { var: { env: prod } }
"#,
            )
            .await
            .unwrap();
        assert_eq!(h.runner.commands(), vec!["echo A", "deploy"]);
        assert_eq!(report.workspace.variable("env"), Some("staging"));
        assert!(report.workspace.has_choice("staging"));
    }

    #[tokio::test]
    async fn preset_variables_skip_prompts() {
        let h = Harness::new();
        let options = ExecuteOptions::default()
            .with_var("env", "prod")
            .with_var("version", "3.0");
        let report = h
            .run_with(
                r#"
steps:
  - choose:
      message: Target?
      options: [ { id: staging, label: S }, { id: prod, label: P } ]
      as: env
  - prompt:
      message: Version?
      as: version
  - run: release {{version}} to {{env}}
"#,
                options,
            )
            .await
            .unwrap();
        assert!(h.prompter.asked().is_empty());
        assert_eq!(h.runner.commands(), vec!["release 3.0 to prod"]);
        assert_eq!(report.workspace.fact("version"), Some("3.0"));
    }

    #[tokio::test]
    async fn preset_not_in_options_still_prompts() {
        let h = Harness::new();
        h.prompter.push_choice("b");
        let options = ExecuteOptions::default().with_var("pick", "zzz");
        let report = h
            .run_with(
                "steps:\n  - choose:\n      message: Pick\n      options: [ { id: a, label: A }, { id: b, label: B } ]\n      as: pick\n",
                options,
            )
            .await
            .unwrap();
        assert_eq!(h.prompter.asked(), vec!["Pick"]);
        assert_eq!(report.workspace.variable("pick"), Some("b"));
    }

    #[tokio::test]
    async fn choose_without_as_stores_id_as_variable() {
        let h = Harness::new();
        h.prompter.push_choice("fast");
        let report = h
            .run("steps:\n  - choose:\n      message: Mode\n      options: [ { id: fast, label: Fast } ]\n")
            .await
            .unwrap();
        assert_eq!(report.workspace.variable("fast"), Some("fast"));
    }

    #[tokio::test]
    async fn prompt_substitutes_message_and_default() {
        let h = Harness::new();
        let options = ExecuteOptions::default().with_var("app", "api");
        let report = h
            .run_with(
                "steps:\n  - prompt:\n      message: Tag for {{app}}?\n      as: tag\n      default: \"{{app}}-latest\"\n",
                options,
            )
            .await
            .unwrap();
        assert_eq!(h.prompter.asked(), vec!["Tag for api?"]);
        assert_eq!(report.workspace.variable("tag"), Some("api-latest"));
        assert_eq!(report.workspace.fact("tag"), Some("api-latest"));
    }

    #[tokio::test]
    async fn fail_step_aborts_with_message_and_flushes_history() {
        let h = Harness::new();
        let err = h
            .run("steps:\n  - run: before\n  - fail:\n      message: stop here\n  - run: after\n")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "stop here");
        assert_eq!(h.runner.commands(), vec!["before"]);

        let history = h.history.last().unwrap();
        assert_eq!(history.records.len(), 2);
        assert_eq!(history.records[1].status, StepStatus::Failure);
        assert_eq!(history.records[1].stderr, "stop here");
    }

    #[tokio::test]
    async fn skipped_steps_leave_no_record() {
        let h = Harness::new();
        h.run("steps:\n  - run: a\n  - run: b\n    when: { var: nope }\n")
            .await
            .unwrap();
        let history = h.history.last().unwrap();
        assert_eq!(history.records.len(), 1);
        assert_eq!(history.records[0].resolved_command.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn prompt_error_propagates() {
        let h = Harness::new();
        let err = h
            .run("steps:\n  - prompt:\n      message: Name?\n      as: name\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelinerError::Prompt(_)));
    }

    #[tokio::test]
    async fn empty_choice_id_is_invalid() {
        let h = Harness::new();
        h.prompter.push_choice("");
        let err = h
            .run("steps:\n  - choose:\n      message: Pick\n      options: [ { id: a, label: A } ]\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelinerError::InvalidChoice(_)));
    }

    #[tokio::test]
    async fn events_cover_a_run() {
        let h = Harness::new();
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        engine(&h.runner, &h.prompter, &h.history)
            .with_events(bus)
            .execute(&workflow("steps:\n  - run: x\n"), ExecuteOptions::default())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                EngineEvent::WorkflowStarted { .. } => "started",
                EngineEvent::StepStarted { .. } => "step",
                EngineEvent::StepCompleted { .. } => "done",
                EngineEvent::WorkflowCompleted { success: true, .. } => "finished",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "step", "done", "finished"]);
    }
}

use tracing::{debug, error, info, warn};

use pipeliner_core::{EngineEvent, ParallelStep, StepRecord, StepStatus};

use crate::condition::ConditionEvaluator;
use crate::executor::{StepContext, StepDispatcher};
use crate::workspace::Workspace;

/// Branch indices are encoded as `parent * PARALLEL_INDEX_MULTIPLIER + branch`.
pub const PARALLEL_INDEX_MULTIPLIER: usize = 1000;

/// Run a parallel group and return whether every executed branch succeeded.
///
/// Each branch works on its own clone of `workspace`. Clones are taken
/// before any `when` is evaluated, so a branch never sees a sibling's writes.
/// Variables and facts of the branches that succeeded are merged back in
/// declaration order; a failed branch's clone is dropped.
pub(crate) async fn run_parallel(
    dispatcher: &StepDispatcher,
    group: &ParallelStep,
    workspace: &mut Workspace,
    ctx: &StepContext,
) -> bool {
    let clones: Vec<Workspace> = group.steps.iter().map(|_| workspace.clone()).collect();

    let mut handles = Vec::new();
    for ((branch_index, step), mut branch_ws) in group.steps.iter().enumerate().zip(clones) {
        let branch_ctx = StepContext {
            step_index: ctx.step_index * PARALLEL_INDEX_MULTIPLIER + branch_index,
            branch_index: Some(branch_index),
            line_number: ctx.line_number,
            live: false,
        };

        if let Some(condition) = &step.when {
            if !ConditionEvaluator::new(&branch_ws).evaluate(condition) {
                debug!(step = ctx.step_index, branch = branch_index, "Branch condition not met");
                dispatcher.events().publish(EngineEvent::StepSkipped {
                    index: branch_ctx.step_index,
                });
                continue;
            }
        }

        let kind = step.kind_name();
        let dispatcher = dispatcher.clone();
        let step = step.clone();
        let handle = tokio::spawn(async move {
            let result = dispatcher.run_step(&step, &mut branch_ws, &branch_ctx).await;
            let success = match &result {
                Ok(outcome) => outcome.success,
                Err(e) => {
                    warn!(
                        step = branch_ctx.step_index,
                        branch = branch_index,
                        error = %e,
                        "Parallel branch failed"
                    );
                    false
                }
            };
            if !success {
                branch_ws.set_step_result(branch_ctx.step_index, false);
            }
            (success, branch_ws)
        });
        handles.push((branch_ctx, kind, handle));
    }

    if handles.is_empty() {
        warn!(step = ctx.step_index, "All parallel branches were skipped");
        dispatcher.events().publish(EngineEvent::ParallelEmpty {
            index: ctx.step_index,
        });
        workspace.set_step_result(ctx.step_index, true);
        return true;
    }

    info!(
        step = ctx.step_index,
        branches = handles.len(),
        "Running parallel branches"
    );

    let mut all_succeeded = true;
    let mut finished = Vec::with_capacity(handles.len());
    for (branch_ctx, kind, handle) in handles {
        match handle.await {
            Ok((success, branch_ws)) => {
                all_succeeded &= success;
                if success {
                    finished.push(branch_ws);
                }
            }
            Err(e) => {
                error!(step = branch_ctx.step_index, error = %e, "Parallel branch task died");
                all_succeeded = false;
                dispatcher.recorder().record(StepRecord {
                    step_index: branch_ctx.step_index,
                    branch_index: branch_ctx.branch_index,
                    kind: kind.to_string(),
                    label: format!("Branch {}", branch_ctx.branch_index.unwrap_or_default() + 1),
                    status: StepStatus::Failure,
                    duration_ms: 0,
                    resolved_command: None,
                    choice_value: None,
                    prompt_value: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    line_number: branch_ctx.line_number,
                    file_name: None,
                });
            }
        }
    }

    for branch_ws in &finished {
        workspace.merge_from(branch_ws);
    }
    workspace.set_step_result(ctx.step_index, all_succeeded);
    if !all_succeeded {
        warn!(step = ctx.step_index, "One or more parallel branches failed");
    }
    all_succeeded
}

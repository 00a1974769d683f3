use std::io::{self, Write};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use pipeliner_core::{EngineEvent, EventBus, History, OutputStream, Schedule, StepStatus};
use pipeliner_scheduler::timezone;

/// Print engine events until the workflow completes.
pub fn spawn_printer(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("[... {} events dropped]", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if print_event(&event) {
                break;
            }
        }
    })
}

/// Print scheduler notifications forever.
pub fn spawn_schedule_printer(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::ScheduleFired { name, .. }) => {
                    eprintln!("[schedule] {} started", name);
                }
                Ok(EngineEvent::ScheduleFinished { name, error, .. }) => match error {
                    None => eprintln!("[schedule] {} completed", name),
                    Some(error) => eprintln!("[schedule] {} failed: {}", name, error),
                },
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Returns true once the run is over.
fn print_event(event: &EngineEvent) -> bool {
    match event {
        EngineEvent::WorkflowStarted { name, steps } => {
            eprintln!(
                "\n▶ {} ({} steps)",
                name.as_deref().unwrap_or("workflow"),
                steps
            );
        }
        EngineEvent::StepStarted { index, kind, label } => {
            eprintln!("\n[{} {}] {}", step_number(*index), kind, label);
        }
        EngineEvent::StepSkipped { index } => {
            eprintln!("[{} skipped]", step_number(*index));
        }
        EngineEvent::OutputLine { stream, line, .. } => match stream {
            OutputStream::Stdout => {
                println!("  {}", line);
                io::stdout().flush().ok();
            }
            OutputStream::Stderr => eprintln!("  {}", line),
        },
        EngineEvent::RetryScheduled {
            index,
            attempt,
            delay_ms,
        } => {
            eprintln!(
                "[{} attempt {} failed, retrying in {}ms]",
                step_number(*index),
                attempt,
                delay_ms
            );
        }
        EngineEvent::FallbackStarted { index, command } => {
            eprintln!("[{} onError] {}", step_number(*index), command);
        }
        EngineEvent::StepCompleted {
            index,
            status,
            duration_ms,
        } => {
            let mark = match status {
                StepStatus::Success => "ok",
                StepStatus::Failure => "FAILED",
            };
            eprintln!("[{} {} in {}]", step_number(*index), mark, format_duration(*duration_ms));
        }
        EngineEvent::ParallelEmpty { index } => {
            eprintln!("[{} all branches skipped]", step_number(*index));
        }
        EngineEvent::WorkflowCompleted {
            success,
            elapsed_ms,
        } => {
            let verdict = if *success { "✓ completed" } else { "✗ failed" };
            eprintln!("\n{} in {}", verdict, format_duration(*elapsed_ms));
            return true;
        }
        EngineEvent::ScheduleArmed { .. }
        | EngineEvent::ScheduleFired { .. }
        | EngineEvent::ScheduleFinished { .. } => {}
    }
    false
}

/// 1-based step number; parallel branches print as `2.1`.
fn step_number(index: usize) -> String {
    const MULTIPLIER: usize = pipeliner_engine::parallel::PARALLEL_INDEX_MULTIPLIER;
    if index >= MULTIPLIER {
        format!("step {}.{}", index / MULTIPLIER + 1, index % MULTIPLIER + 1)
    } else {
        format!("step {}", index + 1)
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

pub fn print_schedule(schedule: &Schedule) {
    let state = if schedule.enabled { "enabled" } else { "disabled" };
    println!("{}  {}", schedule.id, schedule.display_name());
    println!("    cron:     {} ({})", schedule.cron, timezone::describe(schedule.timezone.as_deref()));
    println!("    workflow: {}", schedule.workflow_path);
    if let Some(profile) = &schedule.profile {
        println!("    profile:  {}", profile);
    }
    println!(
        "    status:   {}{}",
        state,
        if schedule.silent { ", silent" } else { "" }
    );
    println!(
        "    last run: {}",
        schedule.last_run.as_deref().unwrap_or("never")
    );
}

pub fn print_history(history: &History) {
    println!(
        "{} started {}",
        history.workflow_name.as_deref().unwrap_or("workflow"),
        history.initial_timestamp
    );
    for record in &history.records {
        let mark = match record.status {
            StepStatus::Success => "ok",
            StepStatus::Failure => "FAILED",
        };
        println!(
            "  [{} {}] {} ({}, {})",
            step_number(record.step_index),
            record.kind,
            record.label,
            mark,
            format_duration(record.duration_ms)
        );
        if let Some(command) = &record.resolved_command {
            println!("      $ {}", command);
        }
        if let Some(choice) = &record.choice_value {
            println!("      chose {}", choice);
        }
        if let Some(value) = &record.prompt_value {
            println!("      answered {}", value);
        }
        for line in record.stdout.lines().chain(record.stderr.lines()) {
            println!("      {}", line);
        }
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use pipeliner_core::{
    load_workflow, EngineEvent, EventBus, ExecuteOptions, PipelinerError, Result, Schedule,
};
use pipeliner_engine::{Engine, ExecutionReport};

use crate::cron_expr;
use crate::daemon::DaemonManager;
use crate::store::ScheduleStore;
use crate::timezone;

struct Trigger {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: ScheduleStore,
    daemon: DaemonManager,
    engine: Arc<Engine>,
    events: EventBus,
    runs: TaskTracker,
}

/// Runs workflows on cron schedules.
///
/// Each enabled schedule gets its own trigger task that sleeps until the next
/// fire time. A fired run is tracked separately from its trigger, so
/// disarming never interrupts a run that already started.
pub struct Scheduler {
    inner: Arc<Inner>,
    triggers: Mutex<HashMap<String, Trigger>>,
}

impl Scheduler {
    pub fn new(store: ScheduleStore, daemon: DaemonManager, engine: Arc<Engine>) -> Self {
        let events = engine.events().clone();
        Self {
            inner: Arc::new(Inner {
                store,
                daemon,
                engine,
                events,
                runs: TaskTracker::new(),
            }),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.inner.store
    }

    pub fn daemon(&self) -> &DaemonManager {
        &self.inner.daemon
    }

    /// Arm every enabled schedule.
    ///
    /// Outside daemon mode this refuses to start while a daemon is alive; the
    /// daemon itself records its PID before calling this.
    pub async fn start(&self, daemon_mode: bool) -> Result<Vec<Schedule>> {
        if !daemon_mode {
            if let Some(pid) = self.inner.daemon.daemon_pid().await? {
                return Err(PipelinerError::DaemonAlreadyRunning { pid });
            }
        }
        info!(daemon_mode, pid = std::process::id(), "Starting scheduler");
        self.reload().await
    }

    /// Disarm everything, then arm the enabled schedules from the store.
    ///
    /// A schedule with a bad cron expression is logged and skipped. Returns
    /// the schedules that were armed.
    pub async fn reload(&self) -> Result<Vec<Schedule>> {
        self.stop();

        let schedules = self.inner.store.load().await?;
        let enabled: Vec<Schedule> = schedules.into_iter().filter(|s| s.enabled).collect();
        if enabled.is_empty() {
            info!("No enabled schedules");
            return Ok(Vec::new());
        }

        let mut armed = Vec::with_capacity(enabled.len());
        for schedule in enabled {
            match self.arm(&schedule) {
                Ok(()) => armed.push(schedule),
                Err(e) => {
                    error!(id = %schedule.id, cron = %schedule.cron, error = %e, "Failed to arm schedule")
                }
            }
        }
        info!(count = armed.len(), "Scheduler armed");
        Ok(armed)
    }

    fn arm(&self, schedule: &Schedule) -> Result<()> {
        let cron = cron_expr::parse(&schedule.cron)?;
        let offset = timezone::resolve(schedule.timezone.as_deref());
        if schedule.timezone.is_some() && offset.is_none() {
            warn!(
                id = %schedule.id,
                timezone = schedule.timezone.as_deref().unwrap_or_default(),
                "Invalid timezone offset, using local time"
            );
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(trigger_loop(
            self.inner.clone(),
            schedule.clone(),
            cron,
            offset,
            cancel.clone(),
        ));

        if let Ok(mut triggers) = self.triggers.lock() {
            if let Some(old) = triggers.insert(schedule.id.clone(), Trigger { cancel, handle }) {
                old.cancel.cancel();
            }
        }
        debug!(
            id = %schedule.id,
            cron = %schedule.cron,
            timezone = %timezone::describe(schedule.timezone.as_deref()),
            "Schedule armed"
        );
        self.inner.events.publish(EngineEvent::ScheduleArmed {
            schedule_id: schedule.id.clone(),
            name: schedule.display_name().to_string(),
        });
        Ok(())
    }

    /// Disarm and forget every trigger. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Ok(mut triggers) = self.triggers.lock() {
            for (id, trigger) in triggers.drain() {
                trigger.cancel.cancel();
                debug!(id = %id, "Schedule disarmed");
            }
        }
    }

    /// Ids of the currently armed schedules, sorted.
    pub fn armed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .triggers
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Disarm, let in-flight runs finish, and drop the PID record in daemon mode.
    pub async fn shutdown(&self, daemon_mode: bool) -> Result<()> {
        info!(daemon_mode, "Scheduler shutting down");
        let handles: Vec<JoinHandle<()>> = match self.triggers.lock() {
            Ok(mut triggers) => triggers
                .drain()
                .map(|(_, t)| {
                    t.cancel.cancel();
                    t.handle
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }

        self.inner.runs.close();
        if !self.inner.runs.is_empty() {
            info!(runs = self.inner.runs.len(), "Waiting for scheduled runs to finish");
        }
        self.inner.runs.wait().await;
        self.inner.runs.reopen();

        if daemon_mode {
            self.inner.daemon.remove_daemon_pid().await?;
        }
        Ok(())
    }

    /// Run a schedule's workflow now, the same way a trigger would.
    pub async fn run_schedule(&self, schedule: &Schedule) -> Result<ExecutionReport> {
        self.inner.execute(schedule).await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    /// Load the workflow, apply the profile, run it and stamp `lastRun`.
    async fn execute(&self, schedule: &Schedule) -> Result<ExecutionReport> {
        let path = absolute(&schedule.workflow_path)?;
        let workflow = load_workflow(&path)?;

        let mut options = ExecuteOptions::default();
        if let Some(profile) = &schedule.profile {
            let profile = workflow
                .profile(profile)
                .map_err(|e| PipelinerError::ScheduleConfig(e.to_string()))?;
            options.vars = profile.vars.clone();
        }

        let report = self.engine.execute(&workflow, options).await?;
        self.store.update_last_run(&schedule.id).await?;
        Ok(report)
    }

    /// A trigger fired. Errors end here.
    async fn fire(&self, schedule: Schedule) {
        let name = schedule.display_name().to_string();
        info!(id = %schedule.id, name = %name, "Running scheduled workflow");
        if !schedule.silent {
            self.events.publish(EngineEvent::ScheduleFired {
                schedule_id: schedule.id.clone(),
                name: name.clone(),
            });
        }

        let error = match self.execute(&schedule).await {
            Ok(report) => {
                info!(
                    id = %schedule.id,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Scheduled workflow completed"
                );
                None
            }
            Err(e) => {
                error!(id = %schedule.id, name = %name, error = %e, "Scheduled workflow failed");
                Some(e.to_string())
            }
        };

        if !schedule.silent {
            self.events.publish(EngineEvent::ScheduleFinished {
                schedule_id: schedule.id,
                name,
                error,
            });
        }
    }
}

async fn trigger_loop(
    inner: Arc<Inner>,
    schedule: Schedule,
    cron: CronSchedule,
    offset: Option<chrono::FixedOffset>,
    cancel: CancellationToken,
) {
    loop {
        let Some(fire_at) = next_fire(&cron, offset) else {
            warn!(id = %schedule.id, "Cron expression has no upcoming times");
            break;
        };
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(
            id = %schedule.id,
            fire_at = %fire_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            delay_secs = delay.as_secs(),
            "Next scheduled run"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let inner_run = inner.clone();
                let fired = schedule.clone();
                inner.runs.spawn(async move { inner_run.fire(fired).await });
            }
            _ = cancel.cancelled() => break,
        }
    }
}

fn next_fire(cron: &CronSchedule, offset: Option<chrono::FixedOffset>) -> Option<DateTime<Utc>> {
    match offset {
        Some(tz) => cron.upcoming(tz).next().map(|t| t.with_timezone(&Utc)),
        None => cron.upcoming(Local).next().map(|t| t.with_timezone(&Utc)),
    }
}

fn absolute(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info};

use pipeliner_core::{NewSchedule, Result, Schedule, ScheduleList};

/// The schedule list, persisted as one JSON file.
///
/// Every mutation reads the whole list, changes it and writes it back. There
/// is no file lock; the CLI and a running daemon are expected not to write at
/// the same moment.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All schedules. A missing file is an empty list.
    pub async fn load(&self) -> Result<Vec<Schedule>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let list: ScheduleList = serde_json::from_str(&content)?;
                Ok(list.schedules)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, schedules: Vec<Schedule>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&ScheduleList { schedules })?;
        tokio::fs::write(&self.path, json).await?;
        debug!(path = %self.path.display(), "Saved schedules");
        Ok(())
    }

    /// Append a schedule, assigning its id and creation time.
    pub async fn add(&self, new: NewSchedule) -> Result<Schedule> {
        let mut schedules = self.load().await?;
        let schedule = Schedule {
            id: new_id(),
            name: new.name,
            workflow_path: new.workflow_path,
            cron: new.cron,
            enabled: new.enabled,
            timezone: new.timezone,
            silent: new.silent,
            profile: new.profile,
            created_at: now(),
            last_run: None,
        };
        schedules.push(schedule.clone());
        self.save(schedules).await?;
        info!(id = %schedule.id, cron = %schedule.cron, workflow = %schedule.workflow_path, "Schedule added");
        Ok(schedule)
    }

    /// Remove by id. Returns false if no schedule had that id.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let schedules = self.load().await?;
        let before = schedules.len();
        let kept: Vec<Schedule> = schedules.into_iter().filter(|s| s.id != id).collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.save(kept).await?;
        info!(id, "Schedule removed");
        Ok(true)
    }

    /// Set `enabled`. Returns false if no schedule had that id.
    pub async fn toggle(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut schedules = self.load().await?;
        let Some(schedule) = schedules.iter_mut().find(|s| s.id == id) else {
            return Ok(false);
        };
        schedule.enabled = enabled;
        self.save(schedules).await?;
        info!(id, enabled, "Schedule toggled");
        Ok(true)
    }

    /// Stamp `lastRun` with the current time. Unknown ids are ignored.
    pub async fn update_last_run(&self, id: &str) -> Result<()> {
        let mut schedules = self.load().await?;
        if let Some(schedule) = schedules.iter_mut().find(|s| s.id == id) {
            schedule.last_run = Some(now());
            self.save(schedules).await?;
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.load().await?.into_iter().find(|s| s.id == id))
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

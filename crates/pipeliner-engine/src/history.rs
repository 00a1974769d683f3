use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, SecondsFormat};
use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info};

use pipeliner_core::traits::HistorySink;
use pipeliner_core::{History, HistoryEntry, PipelinerError, Result, StepRecord};

/// Collects step records for one run.
///
/// Cheap to clone; parallel branches share the same buffer and append as
/// they complete.
#[derive(Clone)]
pub struct Recorder {
    started: DateTime<Local>,
    workflow_name: Option<String>,
    records: Arc<Mutex<Vec<StepRecord>>>,
}

impl Recorder {
    pub fn new(workflow_name: Option<String>) -> Self {
        Self {
            started: Local::now(),
            workflow_name,
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, record: StepRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn snapshot(&self) -> History {
        History {
            initial_timestamp: self.started.to_rfc3339_opts(SecondsFormat::Millis, false),
            workflow_name: self.workflow_name.clone(),
            records: self
                .records
                .lock()
                .map(|r| r.clone())
                .unwrap_or_default(),
        }
    }
}

/// History files under one directory, one JSON file per run.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a run to `workflow-YYYY-MM-DD_HH-mm-ss-<hash>.json`.
    pub async fn write(&self, history: &History) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let hash: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        let name = format!(
            "workflow-{}-{}.json",
            Local::now().format("%Y-%m-%d_%H-%M-%S"),
            hash
        );
        let path = self.dir.join(name);

        let json = serde_json::to_string_pretty(history)?;
        tokio::fs::write(&path, json).await?;
        info!(path = %path.display(), records = history.records.len(), "Saved workflow history");
        Ok(path)
    }

    /// History files, newest first. A missing directory is empty.
    pub async fn list(&self) -> Result<Vec<HistoryEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with("workflow-") && file_name.ends_with(".json") {
                entries.push(HistoryEntry {
                    file_name,
                    path: entry.path(),
                });
            }
        }
        // Timestamped names sort chronologically
        entries.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(entries)
    }

    pub async fn load(&self, file_name: &str) -> Result<History> {
        let path = self.entry_path(file_name)?;
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn remove(&self, file_name: &str) -> Result<()> {
        let path = self.entry_path(file_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every history file.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(dir = %self.dir.display(), "Cleared workflow history");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn entry_path(&self, file_name: &str) -> Result<PathBuf> {
        if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
            return Err(PipelinerError::Config(format!(
                "invalid history file name: {}",
                file_name
            )));
        }
        Ok(self.dir.join(file_name))
    }
}

impl HistorySink for HistoryStore {
    fn save(&self, history: History) -> BoxFuture<'_, Result<Option<PathBuf>>> {
        Box::pin(async move { self.write(&history).await.map(Some) })
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use pipeliner_core::config::DaemonConfig;
use pipeliner_core::Result;

const PID_FILE: &str = "scheduler.pid";
const START_TIME_FILE: &str = "scheduler.started";

/// Snapshot of the daemon's PID record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<String>,
}

/// Single-instance guard for the scheduler daemon.
///
/// The daemon is running iff the PID file parses and a signal-0 probe of that
/// PID succeeds. Any other state is stale and gets cleaned up on read.
#[derive(Debug, Clone)]
pub struct DaemonManager {
    dir: PathBuf,
    grace_period: Duration,
    kill_wait: Duration,
}

impl DaemonManager {
    pub fn new(dir: impl Into<PathBuf>, config: &DaemonConfig) -> Self {
        Self {
            dir: dir.into(),
            grace_period: config.grace_period(),
            kill_wait: config.kill_wait(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    fn start_time_path(&self) -> PathBuf {
        self.dir.join(START_TIME_FILE)
    }

    /// PID of the live daemon, if any.
    pub async fn daemon_pid(&self) -> Result<Option<u32>> {
        let path = self.pid_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match content.trim().parse::<u32>() {
            Ok(pid) if is_pid_alive(pid) => Ok(Some(pid)),
            Ok(pid) => {
                debug!(pid, "Removing stale daemon PID file");
                remove_if_exists(&path).await?;
                Ok(None)
            }
            Err(_) => {
                warn!(path = %path.display(), "Removing unparsable daemon PID file");
                remove_if_exists(&path).await?;
                Ok(None)
            }
        }
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.daemon_pid().await?.is_some())
    }

    /// Record the current process as the daemon.
    ///
    /// Each file is written to a temporary sibling and renamed into place.
    pub async fn save_daemon_pid(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        write_atomic(&self.start_time_path(), &started).await?;
        write_atomic(&self.pid_path(), &std::process::id().to_string()).await?;
        info!(pid = std::process::id(), dir = %self.dir.display(), "Saved daemon PID");
        Ok(())
    }

    /// Remove the PID record. Missing files are fine.
    pub async fn remove_daemon_pid(&self) -> Result<()> {
        remove_if_exists(&self.pid_path()).await?;
        remove_if_exists(&self.start_time_path()).await?;
        Ok(())
    }

    /// When the daemon started. Falls back to the PID file's mtime.
    pub async fn start_time(&self) -> Option<String> {
        if let Ok(content) = tokio::fs::read_to_string(self.start_time_path()).await {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        let modified = tokio::fs::metadata(self.pid_path())
            .await
            .and_then(|m| m.modified())
            .ok()?;
        Some(DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        let pid = self.daemon_pid().await?;
        let start_time = match pid {
            Some(_) => self.start_time().await,
            None => None,
        };
        Ok(DaemonStatus {
            running: pid.is_some(),
            pid,
            start_time,
        })
    }

    /// Terminate the daemon: SIGTERM, a grace period, then SIGKILL if needed.
    ///
    /// The PID record is removed either way. Returns whether the process is
    /// confirmed gone; `false` also when no daemon was running.
    pub async fn stop_daemon(&self) -> Result<bool> {
        let Some(pid) = self.daemon_pid().await? else {
            return Ok(false);
        };

        info!(pid, "Stopping scheduler daemon");
        send_signal(pid, libc::SIGTERM);
        tokio::time::sleep(self.grace_period).await;

        if is_pid_alive(pid) {
            warn!(pid, "Daemon still alive after SIGTERM, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            tokio::time::sleep(self.kill_wait).await;
        }

        let gone = !is_pid_alive(pid);
        self.remove_daemon_pid().await?;
        if !gone {
            warn!(pid, "Daemon did not exit");
        }
        Ok(gone)
    }
}

/// Whether a process with the given PID exists.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) probes without delivering a signal
    unsafe { libc::kill(pid, 0) == 0 }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        if pid > 0 {
            unsafe {
                libc::kill(pid, signal);
            }
        }
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

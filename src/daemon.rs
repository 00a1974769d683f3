use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info};

use pipeliner_scheduler::DaemonManager;

/// Set in the environment of the re-executed daemon child.
pub const DAEMON_ENV: &str = "PIPELINER_DAEMON_MODE";

const LOG_FILE: &str = "scheduler.log";
const STARTUP_CHECKS: u32 = 3;
const STARTUP_CHECK_INTERVAL: Duration = Duration::from_millis(800);

pub fn is_daemon_child() -> bool {
    std::env::var(DAEMON_ENV).map(|v| v == "true").unwrap_or(false)
}

/// Re-run this binary detached with the same arguments.
///
/// The child's output goes to `scheduler.log` in the daemon directory.
/// Returns the PID recorded by the child once it is up.
pub async fn spawn_detached(manager: &DaemonManager) -> anyhow::Result<Option<u32>> {
    std::fs::create_dir_all(manager.dir())?;
    let log_path = manager.dir().join(LOG_FILE);
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(DAEMON_ENV, "true")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .spawn()?;
    debug!(pid = child.id(), log = %log_path.display(), "Spawned scheduler daemon");

    for _ in 0..STARTUP_CHECKS {
        tokio::time::sleep(STARTUP_CHECK_INTERVAL).await;
        if let Some(pid) = manager.daemon_pid().await? {
            info!(pid, "Scheduler daemon is up");
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

/// Last lines of the daemon log, for reporting a failed start.
pub fn log_tail(dir: &Path, lines: usize) -> Option<String> {
    let content = std::fs::read_to_string(dir.join(LOG_FILE)).ok()?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    let tail = all[start..].join("\n");
    (!tail.trim().is_empty()).then_some(tail)
}

/// Wait for Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

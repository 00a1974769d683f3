use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelinerError, Result};

/// Top-level Pipeliner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelinerConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of all per-user state. Default: ~/.pipeliner
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default)]
    pub schedules_file: Option<String>,
    #[serde(default)]
    pub daemon_dir: Option<String>,
    #[serde(default)]
    pub history_dir: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            schedules_file: None,
            daemon_dir: None,
            history_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Write a history file after each run.
    #[serde(default = "default_record_history")]
    pub record_history: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            record_history: default_record_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Wait after SIGTERM before checking liveness.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Wait after SIGKILL before giving up.
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            kill_wait_ms: default_kill_wait_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

fn default_home() -> String {
    "~/.pipeliner".to_string()
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_record_history() -> bool {
    true
}
fn default_grace_period_ms() -> u64 {
    1000
}
fn default_kill_wait_ms() -> u64 {
    500
}

/// Filesystem locations, resolved once and handed to the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub home: PathBuf,
    pub schedules_file: PathBuf,
    pub daemon_dir: PathBuf,
    pub history_dir: PathBuf,
}

impl ResolvedPaths {
    /// Default layout under a given root.
    pub fn under(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            schedules_file: home.join("schedules").join("schedules.json"),
            daemon_dir: home.join("daemon"),
            history_dir: home.join("workflow-history"),
            home,
        }
    }
}

impl PipelinerConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PipelinerError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| PipelinerError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location (`~/.pipeliner/config.toml`).
    pub fn default_path() -> PathBuf {
        expand_home(&format!("{}/config.toml", default_home()))
    }

    /// Resolve every configured location, expanding `~`.
    pub fn paths(&self) -> ResolvedPaths {
        let mut resolved = ResolvedPaths::under(expand_home(&self.paths.home));
        if let Some(file) = &self.paths.schedules_file {
            resolved.schedules_file = expand_home(file);
        }
        if let Some(dir) = &self.paths.daemon_dir {
            resolved.daemon_dir = expand_home(dir);
        }
        if let Some(dir) = &self.paths.history_dir {
            resolved.history_dir = expand_home(dir);
        }
        resolved
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_PIPELINER_VAR", "/data");
        let result = expand_env_vars("home = \"${TEST_PIPELINER_VAR}\"");
        assert_eq!(result, "home = \"/data\"");
        std::env::remove_var("TEST_PIPELINER_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("home = \"${NONEXISTENT_PIPELINER_VAR}\"");
        assert_eq!(result, "home = \"${NONEXISTENT_PIPELINER_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: PipelinerConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.initial_backoff_ms, 1000);
        assert_eq!(config.engine.max_backoff_ms, 10_000);
        assert!(config.engine.record_history);
        assert_eq!(config.daemon.grace_period(), Duration::from_secs(1));
        assert_eq!(config.daemon.kill_wait_ms, 500);
        assert_eq!(config.paths.home, "~/.pipeliner");
    }

    #[test]
    fn test_paths_overrides() {
        let config: PipelinerConfig = toml::from_str(
            r#"
[paths]
home = "/opt/pl"
history_dir = "/var/log/pl-history"
"#,
        )
        .unwrap();
        let paths = config.paths();
        assert_eq!(
            paths.schedules_file,
            PathBuf::from("/opt/pl/schedules/schedules.json")
        );
        assert_eq!(paths.daemon_dir, PathBuf::from("/opt/pl/daemon"));
        assert_eq!(paths.history_dir, PathBuf::from("/var/log/pl-history"));
    }
}

use std::io::Write;
use std::path::PathBuf;

use pipeliner_core::{PipelinerConfig, PipelinerError};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[paths]
home = "/srv/pipeliner"
schedules_file = "/etc/pipeliner/schedules.json"

[engine]
initial_backoff_ms = 250
max_backoff_ms = 2000
record_history = false

[daemon]
grace_period_ms = 3000
kill_wait_ms = 100
"#;

    let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
    tmpfile.write_all(toml_content.as_bytes()).unwrap();

    let config = PipelinerConfig::load(tmpfile.path()).unwrap();
    assert_eq!(config.engine.initial_backoff_ms, 250);
    assert_eq!(config.engine.max_backoff_ms, 2000);
    assert!(!config.engine.record_history);
    assert_eq!(config.daemon.grace_period_ms, 3000);
    assert_eq!(config.daemon.kill_wait_ms, 100);

    let paths = config.paths();
    assert_eq!(paths.home, PathBuf::from("/srv/pipeliner"));
    assert_eq!(
        paths.schedules_file,
        PathBuf::from("/etc/pipeliner/schedules.json")
    );
    assert_eq!(paths.daemon_dir, PathBuf::from("/srv/pipeliner/daemon"));
    assert_eq!(
        paths.history_dir,
        PathBuf::from("/srv/pipeliner/workflow-history")
    );
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("PIPELINER_TEST_HOME_DIR", "/tmp/pl-home");
    let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
    tmpfile
        .write_all(b"[paths]\nhome = \"${PIPELINER_TEST_HOME_DIR}\"\n")
        .unwrap();

    let config = PipelinerConfig::load(tmpfile.path()).unwrap();
    assert_eq!(config.paths().home, PathBuf::from("/tmp/pl-home"));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    assert!(matches!(
        PipelinerConfig::load(&path),
        Err(PipelinerError::ConfigNotFound(_))
    ));
    let config = PipelinerConfig::load_or_default(&path).unwrap();
    assert!(config.engine.record_history);
    assert_eq!(config.daemon.grace_period_ms, 1000);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
    tmpfile.write_all(b"[engine\nbroken").unwrap();
    assert!(matches!(
        PipelinerConfig::load(tmpfile.path()),
        Err(PipelinerError::Config(_))
    ));
}

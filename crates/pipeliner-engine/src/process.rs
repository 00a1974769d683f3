use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use pipeliner_core::traits::CommandRunner;
use pipeliner_core::{
    CommandOutput, CommandRequest, EngineEvent, EventBus, OutputStream, Result,
};

/// How long to keep draining pipes after a timed-out child was killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(200);

/// Runs commands through a real shell with `tokio::process`.
///
/// With a shell override `[program, args..]` the command is appended as the
/// last argument. Otherwise `$SHELL -c <command>` is used, falling back to
/// `/bin/sh`.
#[derive(Clone, Default)]
pub struct ShellRunner {
    events: Option<EventBus>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish live output lines on `bus`.
    pub fn with_events(bus: EventBus) -> Self {
        Self { events: Some(bus) }
    }

    fn build_command(request: &CommandRequest) -> Command {
        let mut cmd = match request.shell.as_deref() {
            Some([program, args @ ..]) => {
                let mut cmd = Command::new(program);
                cmd.args(args).arg(&request.command);
                cmd
            }
            _ => {
                let shell = std::env::var("SHELL")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "/bin/sh".to_string());
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(&request.command);
                cmd
            }
        };
        if let Some(dir) = &request.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if request.live {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }

    async fn execute(&self, request: CommandRequest) -> CommandOutput {
        debug!(command = %request.command, cwd = ?request.cwd, "Spawning command");

        let mut child = match Self::build_command(&request).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %request.command, error = %e, "Failed to spawn command");
                return CommandOutput {
                    success: false,
                    exit_code: None,
                    stderr: vec![format!("Error: {}", e)],
                    ..Default::default()
                };
            }
        };

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let live_bus = self.events.clone().filter(|_| request.live);

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(collect_lines(
                out,
                stdout_buf.clone(),
                OutputStream::Stdout,
                live_bus.clone(),
                request.step_index,
            )));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(collect_lines(
                err,
                stderr_buf.clone(),
                OutputStream::Stderr,
                live_bus,
                request.step_index,
            )));
        }

        let status = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status),
                Err(_) => {
                    warn!(
                        command = %request.command,
                        timeout_secs = limit.as_secs_f64(),
                        "Command timed out, killing"
                    );
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    None
                }
            },
            None => Some(child.wait().await),
        };

        let timed_out = status.is_none();
        for mut reader in readers {
            if timed_out {
                // A backgrounded grandchild may still hold the pipe open
                if tokio::time::timeout(DRAIN_AFTER_KILL, &mut reader)
                    .await
                    .is_err()
                {
                    reader.abort();
                }
            } else {
                let _ = reader.await;
            }
        }

        let stdout = take_lines(&stdout_buf);
        let mut stderr = take_lines(&stderr_buf);

        match status {
            Some(Ok(status)) => CommandOutput {
                success: status.success(),
                exit_code: status.code(),
                stdout,
                stderr,
                timed_out: false,
            },
            Some(Err(e)) => {
                stderr.push(format!("Error: {}", e));
                CommandOutput {
                    success: false,
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: false,
                }
            }
            None => {
                let secs = request.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                stderr.push(format!("Command timed out after {} seconds", secs));
                CommandOutput {
                    success: false,
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: true,
                }
            }
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, request: CommandRequest) -> BoxFuture<'_, Result<CommandOutput>> {
        Box::pin(async move { Ok(self.execute(request).await) })
    }
}

/// Read `reader` to EOF line by line.
///
/// Invalid UTF-8 is decoded lossily; the pipe is always drained to EOF.
async fn collect_lines<R>(
    reader: R,
    buf: Arc<Mutex<Vec<String>>>,
    stream: OutputStream,
    bus: Option<EventBus>,
    index: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Output stream read failed");
                break;
            }
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        if let Some(bus) = &bus {
            bus.publish(EngineEvent::OutputLine {
                index,
                stream,
                line: line.clone(),
            });
        }
        if let Ok(mut buf) = buf.lock() {
            buf.push(line);
        }
    }
}

fn take_lines(buf: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    let mut lines = buf.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default();
    if lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            shell: Some(vec!["/bin/sh".into(), "-c".into()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout_lines() {
        let out = ShellRunner::new()
            .run(request("echo one; echo two"))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn reports_exit_code_and_stderr() {
        let out = ShellRunner::new()
            .run(request("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr, vec!["oops"]);
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let mut req = request("ls");
        req.cwd = Some(dir.path().to_path_buf());
        let out = ShellRunner::new().run(req).await.unwrap();
        assert!(out.stdout.iter().any(|l| l == "marker.txt"));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let mut req = request("sleep 5");
        req.timeout = Some(Duration::from_secs(1));
        let started = std::time::Instant::now();
        let out = ShellRunner::new().run(req).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(out.timed_out);
        assert!(!out.success);
        assert_eq!(
            out.stderr.last().map(String::as_str),
            Some("Command timed out after 1 seconds")
        );
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_reading() {
        let out = ShellRunner::new()
            .run(request("printf 'a\\377b\\n'; seq 1 200000; printf LAST"))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.len(), 200_002);
        assert_eq!(out.stdout[0], "a\u{FFFD}b");
        assert_eq!(out.stdout[200_000], "200000");
        assert_eq!(out.stdout.last().map(String::as_str), Some("LAST"));
    }

    #[tokio::test]
    async fn spawn_failure_is_failed_output() {
        let req = CommandRequest {
            command: "true".into(),
            shell: Some(vec!["/definitely/not/a/shell".into()]),
            ..Default::default()
        };
        let out = ShellRunner::new().run(req).await.unwrap();
        assert!(!out.success);
        assert!(out.stderr[0].starts_with("Error: "));
    }

    #[tokio::test]
    async fn live_output_is_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut req = request("echo streamed");
        req.live = true;
        req.step_index = 7;
        ShellRunner::with_events(bus).run(req).await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::OutputLine { index, stream, line } => {
                assert_eq!(index, 7);
                assert_eq!(stream, OutputStream::Stdout);
                assert_eq!(line, "streamed");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

//! Runs one build step and streams its output.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BuildError, BuildStage, BuildStep, LogLine};
use crate::processes;

/// How long output still buffered in the pipes is collected after the step exits
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Spawn `step`, hand every output line to `on_line` as it arrives and
/// return the exit status.
///
/// Lines from stdout and stderr share one channel, so they reach `on_line`
/// in the order the reader tasks saw them. The step is finished when its
/// process exits, even if a helper it left behind still holds the pipes
/// open. When `timeout` is set and the step overruns, the process tree is
/// killed.
pub async fn run_step<F>(
    step: &BuildStep,
    stage: BuildStage,
    timeout: Option<Duration>,
    mut on_line: F,
) -> Result<ExitStatus, BuildError>
where
    F: FnMut(LogLine),
{
    debug!(command = %step.display_command(), cwd = %step.cwd.display(), "Spawning build step");

    let mut child = Command::new(&step.command)
        .args(&step.args)
        .current_dir(&step.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BuildError::Spawn {
            command: step.display_command(),
            source,
        })?;
    let pid = child.id();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, false, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, true, tx.clone()));
    }
    drop(tx);

    let work = async {
        let status = loop {
            tokio::select! {
                Some(line) = rx.recv() => on_line(line),
                status = child.wait() => break status,
            }
        };

        let drain = tokio::time::sleep(OUTPUT_DRAIN);
        tokio::pin!(drain);
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => on_line(line),
                    None => break,
                },
                () = &mut drain => {
                    debug!(stage = %stage, "Step exited with its output still held open");
                    break;
                }
            }
        }
        status
    };

    let status = match timeout {
        None => work.await,
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(status) => status,
            Err(_) => {
                warn!(stage = %stage, after = ?limit, "Build step timed out, killing it");
                readers.iter().for_each(JoinHandle::abort);
                if let Some(pid) = pid {
                    processes::terminate_tree(pid);
                }
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Build step already exited");
                }
                return Err(BuildError::StepTimeout { stage, after: limit });
            }
        },
    };

    readers.iter().for_each(JoinHandle::abort);
    status.map_err(BuildError::Wait)
}

fn spawn_line_reader<R>(
    stream: R,
    is_error: bool,
    tx: mpsc::UnboundedSender<LogLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(LogLine::new(text, is_error)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> BuildStep {
        BuildStep {
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_lines_are_tagged_by_stream() {
        let mut lines = Vec::new();
        let status = run_step(
            &sh("echo out-1; echo err-1 >&2; sleep 0.1; echo out-2"),
            BuildStage::Installing,
            None,
            |line| lines.push(line),
        )
        .await
        .unwrap();

        assert!(status.success());
        let tagged: Vec<_> = lines.iter().map(|l| (l.text.as_str(), l.is_error)).collect();
        assert!(tagged.contains(&("out-1", false)));
        assert!(tagged.contains(&("err-1", true)));
        assert_eq!(tagged.last(), Some(&("out-2", false)));
    }

    #[tokio::test]
    async fn test_exit_code_is_returned() {
        let status = run_step(&sh("exit 3"), BuildStage::Building, None, |_| {})
            .await
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let err = run_step(
            &sh("echo started; sleep 30"),
            BuildStage::Building,
            Some(Duration::from_millis(300)),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::StepTimeout {
                stage: BuildStage::Building,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_background_helper_does_not_hold_step_open() {
        let started = std::time::Instant::now();
        let mut lines = Vec::new();
        let status = run_step(
            &sh("sleep 6 & echo installed; exit 0"),
            BuildStage::Installing,
            None,
            |line| lines.push(line.text),
        )
        .await
        .unwrap();

        assert!(status.success());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(lines, vec!["installed"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_names_command() {
        let step = BuildStep {
            command: PathBuf::from("/nonexistent/deskpack-tool"),
            args: vec!["install".to_string()],
            cwd: std::env::temp_dir(),
        };
        let err = run_step(&step, BuildStage::Installing, None, |_| {})
            .await
            .unwrap_err();
        match err {
            BuildError::Spawn { command, .. } => {
                assert_eq!(command, "/nonexistent/deskpack-tool install");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}

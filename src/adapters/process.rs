//! Process adapter: runs a stage's own program.
//!
//! The child inherits stdout. Stderr is forwarded line by line to the log
//! and the last lines are kept as failure diagnostics. There is no timeout:
//! a hung stage hangs the run.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{Adapter, AdapterOutput, Invocation, InvocationTarget};
use crate::core::StageFailure;

/// Number of stderr lines kept for failure diagnostics
pub const STDERR_TAIL_LINES: usize = 20;

/// Adapter for process-backed stages
#[derive(Debug, Clone, Default)]
pub struct ProcessAdapter;

impl ProcessAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for ProcessAdapter {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, invocation: &Invocation) -> Result<AdapterOutput, StageFailure> {
        let InvocationTarget::Process {
            program,
            working_dir,
            ..
        } = &invocation.target
        else {
            return Err(StageFailure::Launch(format!(
                "stage '{}' is not a process stage",
                invocation.stage
            )));
        };

        let mut command = Command::new(program);
        command
            .args(invocation.command_args())
            .current_dir(working_dir)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        run_command(&invocation.stage, program, command).await
    }
}

/// Spawn `command`, stream its stderr, and wait for it to exit
pub(crate) async fn run_command(
    stage: &str,
    program: &str,
    mut command: Command,
) -> Result<AdapterOutput, StageFailure> {
    let started = Instant::now();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StageFailure::Launch(format!("failed to spawn '{}': {}", program, e)))?;

    debug!(stage, program, pid = ?child.id(), "Stage process spawned");

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    if let Some(stderr) = child.stderr.take() {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    info!(stage, "| {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| StageFailure::Launch(format!("failed to wait for '{}': {}", program, e)))?;

    let duration_ms = started.elapsed().as_millis() as u64;
    let stderr_tail = Vec::from(tail).join("\n");

    if status.success() {
        return Ok(AdapterOutput {
            exit_code: 0,
            duration_ms,
        });
    }

    match status.code() {
        Some(code) => Err(StageFailure::Exit { code, stderr_tail }),
        None => Err(StageFailure::Terminated { stderr_tail }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str, dir: PathBuf) -> Invocation {
        Invocation {
            stage: "shell".to_string(),
            target: InvocationTarget::Process {
                program: "sh".to_string(),
                fixed_args: vec!["-c".to_string(), script.to_string()],
                working_dir: dir,
            },
            params: Vec::new(),
            env: vec![("WANDB_RUN_GROUP".to_string(), "development".to_string())],
        }
    }

    #[tokio::test]
    async fn test_successful_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let output = ProcessAdapter::new()
            .execute(&shell("exit 0", temp.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_stderr() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = ProcessAdapter::new()
            .execute(&shell("echo boom >&2; exit 3", temp.path().to_path_buf()))
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.diagnostics(), Some("boom"));
    }

    #[tokio::test]
    async fn test_working_dir_and_env() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = "[ \"$WANDB_RUN_GROUP\" = development ] && pwd > where.txt";
        ProcessAdapter::new()
            .execute(&shell(script, temp.path().to_path_buf()))
            .await
            .unwrap();

        let written = std::fs::read_to_string(temp.path().join("where.txt")).unwrap();
        assert_eq!(
            PathBuf::from(written.trim()).canonicalize().unwrap(),
            temp.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = "i=0; while [ $i -lt 50 ]; do echo line$i >&2; i=$((i+1)); done; exit 1";
        let err = ProcessAdapter::new()
            .execute(&shell(script, temp.path().to_path_buf()))
            .await
            .unwrap_err();

        let diagnostics = err.diagnostics().unwrap();
        assert_eq!(diagnostics.lines().count(), STDERR_TAIL_LINES);
        assert!(diagnostics.ends_with("line49"));
    }

    /// Scheduler state from /proc/<pid>/stat, `None` once the pid is gone
    #[cfg(target_os = "linux")]
    fn proc_state(pid: &str) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        stat.rsplit_once(')')?.1.trim_start().chars().next()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_stage_kills_child() {
        let temp = tempfile::TempDir::new().unwrap();
        let invocation = shell("echo $$ > pid; exec sleep 30", temp.path().to_path_buf());

        let adapter = ProcessAdapter::new();
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(500), adapter.execute(&invocation))
                .await;
        assert!(result.is_err(), "sleep 30 should still be running");

        let pid = std::fs::read_to_string(temp.path().join("pid")).unwrap();
        let pid = pid.trim();
        assert!(!pid.is_empty());

        // Killed on drop: the pid disappears or is left as a zombie
        let mut dead = false;
        for _ in 0..100 {
            if matches!(proc_state(pid), None | Some('Z') | Some('X')) {
                dead = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(dead, "stage process {} survived its dropped future", pid);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut invocation = shell("", temp.path().to_path_buf());
        invocation.target = InvocationTarget::Process {
            program: "definitely-not-a-real-program-mlpipe".to_string(),
            fixed_args: Vec::new(),
            working_dir: temp.path().to_path_buf(),
        };

        let err = ProcessAdapter::new().execute(&invocation).await.unwrap_err();
        assert!(matches!(err, StageFailure::Launch(_)));
    }
}

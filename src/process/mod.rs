//! Child interpreter processes speaking newline-delimited JSON.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::runtime::RuntimeError;

pub mod python;

pub use python::PythonRuntime;

/// A child interpreter speaking newline-delimited JSON on stdin/stdout.
pub struct ProcessHandle {
    pub child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessHandle {
    /// Spawn `command` with piped stdio. The child's stderr is forwarded to
    /// the debug log line by line.
    pub fn spawn(mut command: Command) -> Result<Self, RuntimeError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| RuntimeError::Start(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Start("no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Start("no stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "nagini::interpreter", "{line}");
                }
            });
        }

        Ok(Self { child, stdin, stdout: BufReader::new(stdout).lines() })
    }

    pub async fn write_line(&mut self, value: &serde_json::Value) -> Result<(), RuntimeError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.map_err(broken_pipe)?;
        self.stdin.flush().await.map_err(broken_pipe)?;
        Ok(())
    }

    pub async fn read_line(&mut self) -> Result<serde_json::Value, RuntimeError> {
        match self.stdout.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(RuntimeError::Exited),
        }
    }
}

fn broken_pipe(err: std::io::Error) -> RuntimeError {
    if err.kind() == std::io::ErrorKind::BrokenPipe {
        RuntimeError::Exited
    } else {
        RuntimeError::Io(err)
    }
}

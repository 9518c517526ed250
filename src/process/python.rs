//! Python runtime hosted in a `python3` subprocess.
//!
//! The interpreter runs `bootstrap.py`, which keeps one persistent globals
//! dict and answers newline-delimited JSON commands. A scratch directory is
//! both the interpreter's working directory and the root of the virtual
//! filesystem, so files written through the filesystem proxy are visible to
//! `open()` in user code and the other way round.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ProcessHandle;
use crate::config::Config;
use crate::execution::ExecutionError;
use crate::executor::transform::ASYNC_INPUT;
use crate::runtime::{CaptureSurface, DirFs, InputPort, Program, Runtime, RuntimeError, VirtualFs};

const BOOTSTRAP: &str = include_str!("bootstrap.py");

/// Time the interpreter gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Handle to a value stashed inside the interpreter.
#[derive(Debug)]
pub struct PythonBinding(u64);

pub struct PythonRuntime {
    python: String,
    workdir: TempDir,
    fs: DirFs,
    process: Option<ProcessHandle>,
}

impl PythonRuntime {
    pub fn new(python: impl Into<String>) -> Result<Self, RuntimeError> {
        let workdir = tempfile::Builder::new().prefix("nagini-").tempdir()?;
        let fs = DirFs::new(workdir.path());
        Ok(Self { python: python.into(), workdir, fs, process: None })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, RuntimeError> {
        Self::new(cfg.python_bin())
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    fn process(&mut self) -> Result<&mut ProcessHandle, RuntimeError> {
        self.process
            .as_mut()
            .ok_or_else(|| RuntimeError::Start("interpreter not started".into()))
    }

    async fn request(&mut self, command: Value) -> Result<Value, RuntimeError> {
        let process = self.process()?;
        process.write_line(&command).await?;
        let reply = process.read_line().await?;
        into_value(reply)
    }

    async fn request_text(&mut self, cmd: &str) -> Result<String, RuntimeError> {
        match self.request(json!({ "cmd": cmd })).await? {
            Value::String(text) => Ok(text),
            other => Err(RuntimeError::Protocol(format!("expected text for {cmd}, got {other}"))),
        }
    }

    async fn execute(
        &mut self,
        program: Program<'_>,
        input: Option<&dyn InputPort>,
    ) -> Result<(), ExecutionError> {
        let command = json!({
            "cmd": "run",
            "code": program.code,
            "original": program.original,
            "filename": program.filename,
        });
        let process = self.process().map_err(ExecutionError::internal)?;
        process.write_line(&command).await.map_err(ExecutionError::internal)?;

        loop {
            let message = process.read_line().await.map_err(ExecutionError::internal)?;
            if message.get("event").and_then(Value::as_str) == Some("input") {
                let prompt = message.get("prompt").and_then(Value::as_str).unwrap_or_default();
                let reply = match input {
                    Some(port) => match port.request_input(prompt).await {
                        Ok(value) => json!({ "cmd": "input_reply", "value": value }),
                        Err(err) => json!({ "cmd": "input_cancel", "reason": err.to_string() }),
                    },
                    None => json!({
                        "cmd": "input_cancel",
                        "reason": "input is not available for this execution",
                    }),
                };
                process.write_line(&reply).await.map_err(ExecutionError::internal)?;
                continue;
            }
            return match message.get("ok").and_then(Value::as_bool) {
                Some(true) => Ok(()),
                Some(false) => {
                    let error = message.get("error").cloned().unwrap_or_default();
                    Err(serde_json::from_value(error).unwrap_or_else(ExecutionError::internal))
                }
                None => Err(ExecutionError::internal(format!("malformed run reply: {message}"))),
            };
        }
    }
}

fn into_value(reply: Value) -> Result<Value, RuntimeError> {
    match reply.get("ok").and_then(Value::as_bool) {
        Some(true) => Ok(reply.get("value").cloned().unwrap_or(Value::Null)),
        Some(false) => {
            let error = reply.get("error");
            let field = |name: &str| error.and_then(|e| e.get(name)).and_then(Value::as_str).unwrap_or_default();
            Err(RuntimeError::Failed(format!("{}: {}", field("kind"), field("message"))))
        }
        None => Err(RuntimeError::Protocol(format!("unexpected reply: {reply}"))),
    }
}

#[async_trait]
impl CaptureSurface for PythonRuntime {
    async fn reset_captures(&mut self) -> Result<(), RuntimeError> {
        self.request(json!({ "cmd": "reset" })).await.map(|_| ())
    }

    async fn stdout(&mut self) -> Result<String, RuntimeError> {
        self.request_text("stdout").await
    }

    async fn stderr(&mut self) -> Result<String, RuntimeError> {
        self.request_text("stderr").await
    }

    async fn missive(&mut self) -> Result<Option<Value>, RuntimeError> {
        match self.request(json!({ "cmd": "missive" })).await? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn figures(&mut self) -> Result<Vec<String>, RuntimeError> {
        let value = self.request(json!({ "cmd": "figures" })).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl Runtime for PythonRuntime {
    type Binding = PythonBinding;

    async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.process.is_some() {
            return Ok(());
        }
        let mut command = Command::new(&self.python);
        command
            .arg("-u")
            .arg("-c")
            .arg(BOOTSTRAP)
            .arg(ASYNC_INPUT)
            .current_dir(self.workdir.path())
            .env("MPLBACKEND", "Agg")
            .env("PYTHONIOENCODING", "utf-8");
        self.process = Some(ProcessHandle::spawn(command)?);

        match self.request(json!({ "cmd": "ping" })).await {
            Ok(reply) => {
                let version = reply.get("version").and_then(Value::as_str).unwrap_or("unknown");
                info!(python = %self.python, %version, workdir = %self.workdir.path().display(), "interpreter started");
                Ok(())
            }
            Err(err) => {
                self.process = None;
                Err(RuntimeError::Start(format!("{} did not respond: {err}", self.python)))
            }
        }
    }

    async fn load_packages(&mut self, packages: &[String]) -> Result<(), RuntimeError> {
        if packages.is_empty() {
            return Ok(());
        }
        self.request(json!({ "cmd": "load_packages", "packages": packages })).await.map(|_| ())
    }

    async fn install_packages(&mut self, packages: &[String]) -> Result<(), RuntimeError> {
        if packages.is_empty() {
            return Ok(());
        }
        debug!(?packages, "installing packages with pip");
        self.request(json!({ "cmd": "install_packages", "packages": packages })).await.map(|_| ())
    }

    async fn run(&mut self, program: Program<'_>) -> Result<(), ExecutionError> {
        self.execute(program, None).await
    }

    async fn run_async(&mut self, program: Program<'_>, input: &dyn InputPort) -> Result<(), ExecutionError> {
        self.execute(program, Some(input)).await
    }

    async fn get_global(&mut self, name: &str) -> Result<Option<PythonBinding>, RuntimeError> {
        match self.request(json!({ "cmd": "get_global", "name": name })).await? {
            Value::Null => Ok(None),
            value => value
                .as_u64()
                .map(|handle| Some(PythonBinding(handle)))
                .ok_or_else(|| RuntimeError::Protocol(format!("bad stash handle {value}"))),
        }
    }

    async fn set_global(&mut self, name: &str, value: &Value) -> Result<(), RuntimeError> {
        self.request(json!({ "cmd": "set_global", "name": name, "value": value })).await.map(|_| ())
    }

    async fn restore_global(&mut self, name: &str, binding: PythonBinding) -> Result<(), RuntimeError> {
        self.request(json!({ "cmd": "restore_global", "name": name, "handle": binding.0 }))
            .await
            .map(|_| ())
    }

    async fn delete_global(&mut self, name: &str) -> Result<(), RuntimeError> {
        self.request(json!({ "cmd": "delete_global", "name": name })).await.map(|_| ())
    }

    async fn global_names(&mut self) -> Result<Vec<String>, RuntimeError> {
        let value = self.request(json!({ "cmd": "global_names" })).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn fs(&mut self) -> &mut dyn VirtualFs {
        &mut self.fs
    }

    async fn shutdown(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if let Err(err) = process.write_line(&json!({ "cmd": "exit" })).await {
            debug!(error = %err, "interpreter already gone");
        }
        match tokio::time::timeout(EXIT_GRACE, process.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "interpreter exited"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for interpreter"),
            Err(_) => {
                warn!("interpreter did not exit; killing it");
                if let Err(err) = process.child.kill().await {
                    warn!(error = %err, "failed to kill interpreter");
                }
            }
        }
    }
}

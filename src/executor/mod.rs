//! The execution context: owns a [`Runtime`] and serves controller messages.
//!
//! Messages are handled strictly one at a time. While an execution is in
//! flight only `input_response` is acted upon; anything else is deferred and
//! handled, in arrival order, once the execution's `result` has been sent.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::execution::ExecutionError;
use crate::protocol::{
    ControllerMessage, Endpoint, ExecutionReport, ExecutorMessage, FileToLoad, FsOp, FsOutcome,
    Inbox, Namespace, Outbox,
};
use crate::runtime::{Program, Runtime, RuntimeError};

pub mod input;
pub mod loader;
pub mod namespace;
pub mod transform;

pub use input::InputBridge;
pub use loader::{FileLoader, LoadError, LoaderConfig};

pub const ALREADY_INITIALIZED: &str = "Worker already initialized";
pub const NOT_INITIALIZED: &str = "Worker not initialized. Call init() first.";
pub const FS_NOT_INITIALIZED: &str = "Filesystem not available - worker not initialized";

pub struct ExecutionContext<R: Runtime> {
    runtime: R,
    outbox: Outbox,
    inbox: Inbox,
    bridge: InputBridge,
    loader: LoaderConfig,
    initialized: bool,
    loaded_packages: HashSet<String>,
    deferred: VecDeque<Value>,
}

/// Start an execution context on its own task.
pub fn spawn<R: Runtime>(runtime: R, endpoint: Endpoint, loader: LoaderConfig) -> JoinHandle<()> {
    tokio::spawn(ExecutionContext::new(runtime, endpoint, loader).run())
}

impl<R: Runtime> ExecutionContext<R> {
    pub fn new(runtime: R, endpoint: Endpoint, loader: LoaderConfig) -> Self {
        let Endpoint { outbox, inbox } = endpoint;
        Self {
            runtime,
            bridge: InputBridge::new(outbox.clone()),
            outbox,
            inbox,
            loader,
            initialized: false,
            loaded_packages: HashSet::new(),
            deferred: VecDeque::new(),
        }
    }

    /// Serve messages until the controller side of the channel is closed.
    pub async fn run(mut self) {
        loop {
            let value = match self.deferred.pop_front() {
                Some(value) => value,
                None => match self.inbox.recv().await {
                    Some(value) => value,
                    None => break,
                },
            };
            self.handle(value).await;
        }
        self.bridge.cancel();
        self.runtime.shutdown().await;
        info!("execution context stopped");
    }

    fn send(&self, message: ExecutorMessage) {
        if let Err(err) = self.outbox.send(&message) {
            debug!(kind = message.type_name(), error = %err, "dropping outbound message");
        }
    }

    fn send_error(&self, message: impl Into<String>, request_id: Option<u64>) {
        self.send(ExecutorMessage::Error { message: message.into(), request_id });
    }

    async fn handle(&mut self, value: Value) {
        let request_id = value.get("requestId").and_then(Value::as_u64);
        let message = match ControllerMessage::decode(value) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "rejecting controller message");
                self.send_error(err.to_string(), request_id);
                return;
            }
        };
        debug!(kind = message.type_name(), request_id = ?message.request_id(), "controller message");

        match message {
            ControllerMessage::Init { packages, extra_install_packages, files_to_load } => {
                self.handle_init(packages, extra_install_packages, files_to_load).await
            }
            ControllerMessage::Execute { filename, code, namespace, request_id } => {
                self.handle_execute(filename, code, namespace, request_id).await
            }
            ControllerMessage::InputResponse { .. } => {
                warn!("input_response received with no pending input request; ignored");
            }
            ControllerMessage::FsOperation { operation, path, content, request_id } => {
                let reply = match self.filesystem(&operation, &path, content) {
                    Ok(result) => ExecutorMessage::FsResult { result, request_id },
                    Err(error) => {
                        debug!(%operation, %path, %error, "filesystem operation failed");
                        ExecutorMessage::FsError { error, request_id }
                    }
                };
                self.send(reply);
            }
        }
    }

    async fn handle_init(
        &mut self,
        packages: Vec<String>,
        extra_install_packages: Vec<String>,
        files_to_load: Vec<FileToLoad>,
    ) {
        if self.initialized {
            self.send_error(ALREADY_INITIALIZED, None);
            return;
        }
        let started = Instant::now();
        match self.initialize(&packages, &extra_install_packages, &files_to_load).await {
            Ok(()) => {
                self.initialized = true;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "execution context ready");
                self.send(ExecutorMessage::Ready);
            }
            Err(err) => {
                error!(error = %err, "initialization failed");
                self.send_error(format!("Failed to initialize runtime: {err}"), None);
            }
        }
    }

    async fn initialize(
        &mut self,
        packages: &[String],
        extra: &[String],
        files: &[FileToLoad],
    ) -> Result<(), InitError> {
        self.runtime.start().await?;
        self.load_packages(packages).await;

        if !extra.is_empty() {
            match self.runtime.install_packages(extra).await {
                Ok(()) => self.send(ExecutorMessage::Info {
                    message: format!("Installed {} extra packages: {}", extra.len(), extra.join(", ")),
                }),
                Err(err) => self.send(ExecutorMessage::Warning {
                    message: format!("Package installation warning: {err}"),
                }),
            }
        }

        if !files.is_empty() {
            let loader = FileLoader::new(self.loader.clone())?;
            let count = loader.load_all(files, self.runtime.fs()).await?;
            self.send(ExecutorMessage::Info { message: format!("Loaded {count} files") });
        }
        Ok(())
    }

    /// Load packages not loaded yet. Failures are reported as warnings.
    async fn load_packages(&mut self, packages: &[String]) {
        let mut skipped = Vec::new();
        let mut to_load = Vec::new();
        for package in packages {
            if self.loaded_packages.contains(package) || to_load.contains(package) {
                skipped.push(package.clone());
            } else {
                to_load.push(package.clone());
            }
        }
        if !skipped.is_empty() {
            self.send(ExecutorMessage::Info {
                message: format!(
                    "Smart loading: Skipping {} already loaded: {}",
                    skipped.len(),
                    skipped.join(", ")
                ),
            });
        }
        if to_load.is_empty() {
            return;
        }
        match self.runtime.load_packages(&to_load).await {
            Ok(()) => {
                self.send(ExecutorMessage::Info {
                    message: format!(
                        "Smart loading: Successfully loaded {} new packages: {}",
                        to_load.len(),
                        to_load.join(", ")
                    ),
                });
                self.loaded_packages.extend(to_load);
            }
            Err(err) => {
                warn!(error = %err, "package loading failed");
                self.send(ExecutorMessage::Warning { message: format!("Package loading warning: {err}") });
            }
        }
    }

    async fn handle_execute(
        &mut self,
        filename: String,
        code: String,
        namespace: Option<Namespace>,
        request_id: Option<u64>,
    ) {
        if !self.initialized {
            self.send_error(NOT_INITIALIZED, request_id);
            return;
        }
        let started = Instant::now();
        let executed_with_namespace = namespace.is_some();
        debug!(%filename, executed_with_namespace, "executing");

        let outcome = self.execute(&filename, &code, namespace.as_ref()).await;
        let (stdout, stderr, missive, figures, error) = match outcome {
            Ok(()) => match self.collect_outputs().await {
                Ok((stdout, stderr, missive, figures)) => (stdout, stderr, missive, figures, None),
                Err(err) => {
                    let (stdout, stderr) = self.collect_text().await;
                    (stdout, stderr, None, Vec::new(), Some(internal(err)))
                }
            },
            Err(err) => {
                let (stdout, stderr) = self.collect_text().await;
                (stdout, stderr, None, Vec::new(), Some(err))
            }
        };

        let report = ExecutionReport {
            request_id,
            filename,
            stdout,
            stderr,
            missive,
            figures,
            error,
            time: started.elapsed().as_millis() as u64,
            executed_with_namespace,
        };
        debug!(
            filename = %report.filename,
            stdout = report.stdout.len(),
            stderr = report.stderr.len(),
            figures = report.figures.len(),
            error = ?report.error,
            time_ms = report.time,
            "execution finished"
        );
        self.send(ExecutorMessage::Result(report));
    }

    async fn execute(
        &mut self,
        filename: &str,
        code: &str,
        overrides: Option<&Namespace>,
    ) -> Result<(), ExecutionError> {
        self.runtime.reset_captures().await.map_err(internal)?;
        let prepared = transform::prepare(code);

        let snapshot = match overrides {
            Some(overrides) => Some(namespace::apply(&mut self.runtime, overrides).await.map_err(internal)?),
            None => None,
        };

        let program = Program { filename, code: &prepared.code, original: code };
        let outcome = if prepared.wants_input() {
            let run = self.runtime.run_async(program, &self.bridge);
            tokio::pin!(run);
            let mut inbox_open = true;
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    incoming = self.inbox.recv(), if inbox_open => match incoming {
                        Some(value) => route_while_running(value, &self.bridge, &mut self.deferred),
                        None => {
                            inbox_open = false;
                            self.bridge.cancel();
                        }
                    },
                }
            }
        } else {
            self.runtime.run(program).await
        };

        if let Some(snapshot) = snapshot {
            namespace::restore(&mut self.runtime, snapshot).await;
        }
        outcome
    }

    async fn collect_outputs(&mut self) -> Result<(String, String, Option<Value>, Vec<String>), RuntimeError> {
        let stdout = self.runtime.stdout().await?;
        let stderr = self.runtime.stderr().await?;
        let missive = self.runtime.missive().await?;
        let figures = self.runtime.figures().await?;
        Ok((stdout, stderr, missive, figures))
    }

    /// Best-effort stdout/stderr after a failure.
    async fn collect_text(&mut self) -> (String, String) {
        let stdout = self.runtime.stdout().await;
        let stderr = self.runtime.stderr().await;
        match (stdout, stderr) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "output retrieval failed");
                (String::new(), format!("Output retrieval failed: {err}"))
            }
        }
    }

    fn filesystem(&mut self, operation: &str, path: &str, content: Option<String>) -> Result<FsOutcome, String> {
        if !self.initialized {
            return Err(FS_NOT_INITIALIZED.to_string());
        }
        let op: FsOp = operation.parse()?;
        let fs = self.runtime.fs();
        let outcome = match op {
            FsOp::WriteFile => {
                let content = content.ok_or_else(|| "writeFile requires 'content'".to_string())?;
                fs.write_file(path, &content).map(|()| FsOutcome::Success { success: true })
            }
            FsOp::ReadFile => fs.read_file(path).map(|content| FsOutcome::Content { content }),
            FsOp::Mkdir => fs.mkdir(path).map(|()| FsOutcome::Success { success: true }),
            FsOp::Exists => fs.exists(path).map(|exists| FsOutcome::Exists { exists }),
            FsOp::Listdir => fs.listdir(path).map(|files| FsOutcome::Files { files }),
        };
        outcome.map_err(|err| err.to_string())
    }
}

/// Handle a message that arrives while code is running.
fn route_while_running(value: Value, bridge: &InputBridge, deferred: &mut VecDeque<Value>) {
    if value.get("type").and_then(Value::as_str) != Some("input_response") {
        debug!("deferring message until the execution finishes");
        deferred.push_back(value);
        return;
    }
    let input = match value.get("input") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if !bridge.resolve(input) {
        warn!("input_response received with no pending input request; ignored");
    }
}

fn internal(err: RuntimeError) -> ExecutionError {
    ExecutionError::internal(err)
}

#[derive(Debug, thiserror::Error)]
enum InitError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

//! Controller side of the protocol.
//!
//! A [`Controller`] owns one execution context. It sends the `init` message on
//! construction, tracks lifecycle and pending-operation state from the
//! messages it receives, keeps the execution history, and exposes correlated
//! calls (`execute_async`, the filesystem helpers) on top of the one-way
//! channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::execution::{ExecutionHistory, ExecutionResult};
use crate::executor::{self, LoaderConfig};
use crate::protocol::{self, ControllerMessage, ExecutorMessage, FileToLoad, Inbox, Namespace, Outbox};
use crate::runtime::Runtime;

mod correlator;
mod fs;
mod input;

use correlator::{Correlator, Reply, Terminal};
pub use input::{InputCallback, InputRequest, InputResponder};

/// Grace period for tasks to wind down on [`Controller::destroy`].
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub execution_timeout: Duration,
    pub fs_timeout: Duration,
    pub ready_timeout: Duration,
    pub loader: LoaderConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            fs_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(120),
            loader: LoaderConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let defaults = Self::default();
        Self {
            execution_timeout: cfg.get_millis("EXECUTION_TIMEOUT_MS").unwrap_or(defaults.execution_timeout),
            fs_timeout: cfg.get_millis("FS_TIMEOUT_MS").unwrap_or(defaults.fs_timeout),
            ready_timeout: cfg.get_millis("READY_TIMEOUT_MS").unwrap_or(defaults.ready_timeout),
            loader: LoaderConfig::from_config(cfg),
        }
    }
}

/// Contents of the `init` message.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub packages: Vec<String>,
    pub extra_install_packages: Vec<String>,
    pub files_to_load: Vec<FileToLoad>,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn package(mut self, name: impl Into<String>) -> Self {
        self.packages.push(name.into());
        self
    }

    pub fn extra_package(mut self, name: impl Into<String>) -> Self {
        self.extra_install_packages.push(name.into());
        self
    }

    pub fn file(mut self, file: FileToLoad) -> Self {
        self.files_to_load.push(file);
        self
    }

    /// Validate and build the `init` message. Blank package names are
    /// skipped with a warning; malformed file entries are rejected.
    fn into_message(self) -> Result<ControllerMessage> {
        let keep = |list: Vec<String>| -> Vec<String> {
            list.into_iter()
                .filter_map(|p| {
                    let trimmed = p.trim();
                    if trimmed.is_empty() {
                        warn!("skipping blank package name");
                        None
                    } else {
                        Some(trimmed.to_string())
                    }
                })
                .collect()
        };
        for (index, file) in self.files_to_load.iter().enumerate() {
            if file.path.trim().is_empty() {
                return Err(Error::InvalidOptions(format!("filesToLoad[{index}].path must be a non-empty string")));
            }
            match (&file.content, &file.url) {
                (Some(_), None) => {}
                (None, Some(url)) if !url.trim().is_empty() => {}
                _ => {
                    return Err(Error::InvalidOptions(format!(
                        "filesToLoad[{index}] needs exactly one of content or a non-empty url"
                    )))
                }
            }
        }
        Ok(ControllerMessage::Init {
            packages: keep(self.packages),
            extra_install_packages: keep(self.extra_install_packages),
            files_to_load: self.files_to_load,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Destroyed,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Ready => "ready",
            Lifecycle::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOperation {
    None,
    Executing,
    AwaitingInput,
    FilesystemOp,
}

impl PendingOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingOperation::None => "none",
            PendingOperation::Executing => "execution",
            PendingOperation::AwaitingInput => "input",
            PendingOperation::FilesystemOp => "filesystem",
        }
    }
}

/// Snapshot of the execution context as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContextState {
    pub lifecycle: Lifecycle,
    pub pending: PendingOperation,
    pub input_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
    Closed,
}

struct State {
    lifecycle: Lifecycle,
    pending: PendingOperation,
    pending_request: Option<u64>,
    input_prompt: Option<String>,
    input_queue: VecDeque<String>,
    input_callback: Option<InputCallback>,
    history: ExecutionHistory,
}

pub(crate) struct Inner {
    state: Mutex<State>,
    correlator: Correlator,
    outbox: Mutex<Option<Outbox>>,
    readiness: watch::Sender<Readiness>,
    next_request_id: AtomicU64,
    config: ControllerConfig,
}

/// Terminal message after the base handler has seen it.
struct Settled {
    request_id: Option<u64>,
    reply: Reply,
    /// The reply ends the operation the controller is currently tracking.
    expected: bool,
}

impl Inner {
    fn send(&self, message: &ControllerMessage) -> Result<()> {
        let outbox = self.outbox.lock().clone().ok_or(Error::ChannelClosed)?;
        outbox.send(message)?;
        Ok(())
    }

    /// Check lifecycle and the one-outstanding rule, then mark `operation`
    /// as pending for `request_id`.
    fn begin(&self, request_id: u64, operation: PendingOperation) -> Result<()> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Ready => {}
            Lifecycle::Destroyed => return Err(Error::Destroyed),
            other => return Err(Error::NotReady(other.as_str())),
        }
        if state.pending != PendingOperation::None {
            return Err(Error::Busy { pending: state.pending.as_str() });
        }
        state.pending = operation;
        state.pending_request = Some(request_id);
        Ok(())
    }

    fn finish(&self, request_id: u64) -> bool {
        let mut state = self.state.lock();
        if state.pending_request != Some(request_id) {
            return false;
        }
        state.pending = PendingOperation::None;
        state.pending_request = None;
        state.input_prompt = None;
        true
    }

    /// Base handler: runs for every message, before any interceptor.
    fn handle(self: &Arc<Self>, message: ExecutorMessage) -> Option<Settled> {
        debug!(kind = message.type_name(), request_id = ?message.request_id(), "executor message");
        match message {
            ExecutorMessage::Ready => {
                let mut state = self.state.lock();
                if state.lifecycle == Lifecycle::Destroyed {
                    return None;
                }
                state.lifecycle = Lifecycle::Ready;
                drop(state);
                self.readiness.send_replace(Readiness::Ready);
                info!("execution context ready");
                None
            }
            ExecutorMessage::Result(report) => {
                let request_id = report.request_id;
                let result = ExecutionResult::from_report(report, Utc::now());
                if let Some(err) = &result.error {
                    debug!(filename = %result.filename, error = %err, "execution raised");
                }
                self.state.lock().history.push(result.clone());
                Some(self.settle(request_id, Reply::Executed(result)))
            }
            ExecutorMessage::Error { message, request_id } => {
                let initializing = {
                    let mut state = self.state.lock();
                    let initializing = state.lifecycle == Lifecycle::Initializing && request_id.is_none();
                    if initializing {
                        state.lifecycle = Lifecycle::Uninitialized;
                    }
                    initializing
                };
                if initializing {
                    error!(%message, "execution context failed to initialize");
                    self.readiness.send_replace(Readiness::Failed(message));
                    return None;
                }
                error!(%message, ?request_id, "execution context error");
                request_id.map(|id| self.settle(Some(id), Reply::Rejected(message)))
            }
            ExecutorMessage::Warning { message } => {
                warn!(%message, "execution context warning");
                None
            }
            ExecutorMessage::Info { message } => {
                info!(%message, "execution context info");
                None
            }
            ExecutorMessage::InputRequired { prompt } => {
                self.on_input_required(prompt);
                None
            }
            ExecutorMessage::FsResult { result, request_id } => Some(self.settle(request_id, Reply::Fs(result))),
            ExecutorMessage::FsError { error, request_id } => {
                debug!(%error, "filesystem operation failed");
                Some(self.settle(request_id, Reply::FsFailed(error)))
            }
        }
    }

    fn settle(&self, request_id: Option<u64>, reply: Reply) -> Settled {
        let expected = request_id.is_some_and(|id| self.finish(id));
        Settled { request_id, reply, expected }
    }

    fn on_disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.lifecycle = Lifecycle::Destroyed;
            state.pending = PendingOperation::None;
            state.pending_request = None;
            state.input_prompt = None;
        }
        self.outbox.lock().take();
        self.correlator.clear();
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Closed;
                true
            } else {
                false
            }
        });
    }
}

async fn dispatch(inner: Arc<Inner>, mut inbox: Inbox) {
    while let Some(value) = inbox.recv().await {
        let message = match ExecutorMessage::decode(value) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring undecodable executor message");
                continue;
            }
        };
        let Some(settled) = inner.handle(message) else {
            continue;
        };
        if inner.correlator.offer(settled.request_id, settled.reply).is_some() {
            if settled.expected {
                debug!(request_id = ?settled.request_id, "response completed an uncorrelated request");
            } else {
                warn!(request_id = ?settled.request_id, "dropping late or unsolicited response");
            }
        }
    }
    debug!("executor channel closed");
    inner.on_disconnect();
}

/// Clears the pending operation when a call ends, however it ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.finish(self.request_id);
    }
}

pub struct Controller {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Spawn an execution context over `runtime` and send it `init`.
    ///
    /// Must be called from within a tokio runtime. The context is usable once
    /// [`Controller::wait_ready`] returns.
    pub fn new<R: Runtime>(runtime: R, options: InitOptions, config: ControllerConfig) -> Result<Self> {
        let init = options.into_message()?;
        let (local, remote) = protocol::pair();
        let executor = executor::spawn(runtime, remote, config.loader.clone());

        let (readiness, _) = watch::channel(Readiness::Pending);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                lifecycle: Lifecycle::Uninitialized,
                pending: PendingOperation::None,
                pending_request: None,
                input_prompt: None,
                input_queue: VecDeque::new(),
                input_callback: None,
                history: ExecutionHistory::default(),
            }),
            correlator: Correlator::default(),
            outbox: Mutex::new(Some(local.outbox)),
            readiness,
            next_request_id: AtomicU64::new(1),
            config,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner), local.inbox));

        inner.state.lock().lifecycle = Lifecycle::Initializing;
        inner.send(&init)?;
        info!("execution context initializing");

        Ok(Self { inner, tasks: Mutex::new(vec![executor, dispatcher]) })
    }

    /// [`Controller::new`] followed by [`Controller::wait_ready`].
    pub async fn start<R: Runtime>(runtime: R, options: InitOptions, config: ControllerConfig) -> Result<Self> {
        let controller = Self::new(runtime, options, config)?;
        if let Err(err) = controller.wait_ready().await {
            controller.destroy().await;
            return Err(err);
        }
        Ok(controller)
    }

    pub async fn wait_ready(&self) -> Result<()> {
        let limit = self.inner.config.ready_timeout;
        let mut rx = self.inner.readiness.subscribe();
        let outcome = tokio::time::timeout(limit, async {
            rx.wait_for(|r| *r != Readiness::Pending).await.map(|r| (*r).clone())
        })
        .await;
        match outcome {
            Err(_) => Err(Error::Timeout { operation: "initialization", after: limit }),
            Ok(Err(_)) | Ok(Ok(Readiness::Closed)) => Err(Error::ChannelClosed),
            Ok(Ok(Readiness::Failed(message))) => Err(Error::Initialization(message)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Ready
    }

    pub fn state(&self) -> ExecutionContextState {
        let state = self.inner.state.lock();
        ExecutionContextState {
            lifecycle: state.lifecycle,
            pending: state.pending,
            input_prompt: state.input_prompt.clone(),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its terminal reply.
    async fn call(
        &self,
        operation: PendingOperation,
        terminal: Terminal,
        limit: Duration,
        build: impl FnOnce(u64) -> ControllerMessage,
    ) -> Result<Reply> {
        let request_id = self.next_request_id();
        self.inner.begin(request_id, operation)?;
        let _pending = PendingGuard { inner: &self.inner, request_id };
        let waiter = self.inner.correlator.install(request_id, terminal)?;
        self.inner.send(&build(request_id))?;
        waiter.wait(limit, operation.as_str()).await
    }

    /// Run `code` and wait for its result.
    ///
    /// With `namespace`, each key is bound only for this execution; prior
    /// bindings are restored afterwards even if the code raises. Errors raised
    /// by the code are part of the returned result, not an `Err`.
    pub async fn execute_async(
        &self,
        filename: &str,
        code: &str,
        namespace: Option<Namespace>,
    ) -> Result<ExecutionResult> {
        let reply = self
            .call(PendingOperation::Executing, Terminal::Execution, self.inner.config.execution_timeout, |id| {
                ControllerMessage::Execute {
                    filename: filename.to_string(),
                    code: code.to_string(),
                    namespace,
                    request_id: Some(id),
                }
            })
            .await?;
        match reply {
            Reply::Executed(result) => Ok(result),
            Reply::Rejected(message) => Err(Error::Executor(message)),
            other => Err(Error::Protocol(format!("{other:?}"))),
        }
    }

    /// Send `code` for execution without waiting. The result is appended to
    /// the history when it arrives.
    pub fn execute_file(&self, filename: &str, code: &str) -> Result<()> {
        let request_id = self.next_request_id();
        self.inner.begin(request_id, PendingOperation::Executing)?;
        let sent = self.inner.send(&ControllerMessage::Execute {
            filename: filename.to_string(),
            code: code.to_string(),
            namespace: None,
            request_id: Some(request_id),
        });
        if sent.is_err() {
            self.inner.finish(request_id);
        }
        sent
    }

    pub fn history(&self) -> Vec<ExecutionResult> {
        self.inner.state.lock().history.entries().to_vec()
    }

    pub fn last_result(&self) -> Option<ExecutionResult> {
        self.inner.state.lock().history.last().cloned()
    }

    pub fn clear_history(&self) {
        self.inner.state.lock().history.clear();
    }

    /// Close the channel and wait for the execution context to stop.
    pub async fn destroy(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed && self.tasks.lock().is_empty() {
                return;
            }
            state.lifecycle = Lifecycle::Destroyed;
            state.input_queue.clear();
            state.input_callback = None;
        }
        self.inner.outbox.lock().take();
        self.inner.correlator.clear();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "execution context task failed"),
                Err(_) => {
                    warn!("execution context did not stop in time; aborting");
                    task.abort();
                }
            }
        }
        info!("execution context destroyed");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.inner.state.lock().lifecycle = Lifecycle::Destroyed;
        self.inner.outbox.lock().take();
    }
}

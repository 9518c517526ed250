//! Collaborator interfaces consumed by the execution context.
//!
//! The embedded language runtime is external to the protocol. Whatever
//! actually evaluates code plugs in through [`Runtime`], which also exposes
//! the runtime's [`CaptureSurface`] and [`VirtualFs`]. The execution context
//! hands an [`InputPort`] to [`Runtime::run_async`] so running code can
//! suspend for input.

use async_trait::async_trait;
use serde_json::Value;

use crate::execution::ExecutionError;

pub mod fs;

pub use fs::{DirFs, FsError, MemoryFs, VirtualFs};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to start runtime: {0}")]
    Start(String),
    #[error("runtime process exited")]
    Exited,
    #[error("runtime protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Failed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("an input request is already pending")]
    AlreadyPending,
    #[error("input request cancelled")]
    Cancelled,
}

/// Bridge used by running code to obtain a value from the controller.
///
/// Implementations of [`Runtime`] echo the prompt to captured stdout before
/// calling [`InputPort::request_input`]; the port only carries the request.
#[async_trait]
pub trait InputPort: Send + Sync {
    async fn request_input(&self, prompt: &str) -> Result<String, InputError>;
}

/// Buffers owned by the runtime for the duration of one execution.
#[async_trait]
pub trait CaptureSurface: Send {
    /// Clear stdout/stderr/missive/figures and close leftover artifact handles.
    async fn reset_captures(&mut self) -> Result<(), RuntimeError>;
    async fn stdout(&mut self) -> Result<String, RuntimeError>;
    async fn stderr(&mut self) -> Result<String, RuntimeError>;
    /// The structured payload sent during the current execution, if any.
    async fn missive(&mut self) -> Result<Option<Value>, RuntimeError>;
    /// Rendered artifacts as base64 encoded images.
    async fn figures(&mut self) -> Result<Vec<String>, RuntimeError>;
}

/// Source handed to the runtime. `code` may be the rewritten form of
/// `original`; both always have the same number of lines.
#[derive(Debug, Clone, Copy)]
pub struct Program<'a> {
    pub filename: &'a str,
    pub code: &'a str,
    pub original: &'a str,
}

impl<'a> Program<'a> {
    pub fn unmodified(filename: &'a str, code: &'a str) -> Self {
        Self { filename, code, original: code }
    }
}

#[async_trait]
pub trait Runtime: CaptureSurface + Send + 'static {
    /// Opaque copy of a global binding taken before a namespace override.
    type Binding: Send;

    async fn start(&mut self) -> Result<(), RuntimeError>;

    /// Make already available packages importable.
    async fn load_packages(&mut self, packages: &[String]) -> Result<(), RuntimeError>;

    /// Fetch and install packages the runtime does not bundle.
    async fn install_packages(&mut self, packages: &[String]) -> Result<(), RuntimeError>;

    /// Evaluate code that never suspends.
    async fn run(&mut self, program: Program<'_>) -> Result<(), ExecutionError>;

    /// Evaluate code that may request input through `input`.
    async fn run_async(
        &mut self,
        program: Program<'_>,
        input: &dyn InputPort,
    ) -> Result<(), ExecutionError>;

    async fn get_global(&mut self, name: &str) -> Result<Option<Self::Binding>, RuntimeError>;
    async fn set_global(&mut self, name: &str, value: &Value) -> Result<(), RuntimeError>;
    async fn restore_global(&mut self, name: &str, binding: Self::Binding)
        -> Result<(), RuntimeError>;
    async fn delete_global(&mut self, name: &str) -> Result<(), RuntimeError>;
    /// Names currently bound in the global scope.
    async fn global_names(&mut self) -> Result<Vec<String>, RuntimeError>;

    fn fs(&mut self) -> &mut dyn VirtualFs;

    async fn shutdown(&mut self) {}
}

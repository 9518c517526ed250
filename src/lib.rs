//! Controller–executor protocol for running untrusted code in an isolated
//! execution context.
//!
//! A [`Controller`] owns one execution context reached only through a
//! message channel. It initializes the context, runs code with optional
//! per-call namespace overrides, answers the context's input requests and
//! proxies filesystem operations, correlating each reply with its request.

pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod executor;
pub mod printer;
pub mod process;
pub mod protocol;
pub mod runtime;

pub use controller::{
    Controller, ControllerConfig, ExecutionContextState, InitOptions, InputCallback, InputRequest,
    InputResponder, Lifecycle, PendingOperation,
};
pub use error::{Error, Result};
pub use execution::{ExecutionError, ExecutionResult};
pub use process::PythonRuntime;
pub use protocol::{FileToLoad, FsOp, FsOutcome, Namespace};

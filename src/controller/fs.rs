//! Filesystem proxy: correlated `fs_operation` calls.

use super::correlator::{Reply, Terminal};
use super::{Controller, PendingOperation};
use crate::error::{Error, Result};
use crate::protocol::{ControllerMessage, FsOp, FsOutcome};

impl Controller {
    pub async fn fs(&self, op: FsOp, path: &str, content: Option<String>) -> Result<FsOutcome> {
        self.fs_operation(op.as_str(), path, content).await
    }

    /// Send an operation by name. Names the execution context does not know
    /// are rejected by it with an `fs_error`.
    pub async fn fs_operation(&self, operation: &str, path: &str, content: Option<String>) -> Result<FsOutcome> {
        let limit = self.inner.config.fs_timeout;
        let reply = self
            .call(PendingOperation::FilesystemOp, Terminal::Filesystem, limit, |id| {
                ControllerMessage::FsOperation {
                    operation: operation.to_string(),
                    path: path.to_string(),
                    content,
                    request_id: Some(id),
                }
            })
            .await?;
        match reply {
            Reply::Fs(outcome) => Ok(outcome),
            Reply::FsFailed(message) | Reply::Rejected(message) => Err(Error::Filesystem(message)),
            other => Err(Error::Protocol(format!("{other:?}"))),
        }
    }

    pub async fn write_file(&self, path: &str, content: impl Into<String>) -> Result<()> {
        match self.fs(FsOp::WriteFile, path, Some(content.into())).await? {
            FsOutcome::Success { .. } => Ok(()),
            other => Err(unexpected(FsOp::WriteFile, other)),
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        match self.fs(FsOp::ReadFile, path, None).await? {
            FsOutcome::Content { content } => Ok(content),
            other => Err(unexpected(FsOp::ReadFile, other)),
        }
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        match self.fs(FsOp::Mkdir, path, None).await? {
            FsOutcome::Success { .. } => Ok(()),
            other => Err(unexpected(FsOp::Mkdir, other)),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.fs(FsOp::Exists, path, None).await? {
            FsOutcome::Exists { exists } => Ok(exists),
            other => Err(unexpected(FsOp::Exists, other)),
        }
    }

    pub async fn listdir(&self, path: &str) -> Result<Vec<String>> {
        match self.fs(FsOp::Listdir, path, None).await? {
            FsOutcome::Files { files } => Ok(files),
            other => Err(unexpected(FsOp::Listdir, other)),
        }
    }
}

fn unexpected(op: FsOp, outcome: FsOutcome) -> Error {
    Error::Protocol(format!("unexpected {op} result: {outcome:?}"))
}

//! Wire messages exchanged between the controller and the execution context.
//!
//! Every message is a JSON object tagged by `type`, with camelCase field
//! names (`filesToLoad`, `requestId`, ...). Terminal messages echo the
//! `requestId` of the request they answer so a late response can never be
//! mistaken for a newer one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::ExecutionError;

pub mod channel;

pub use channel::{pair, ChannelError, Endpoint, Inbox, Outbox};

/// Caller supplied bindings injected for a single execution.
pub type Namespace = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileToLoad {
    /// Target path inside the execution context's filesystem.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FileToLoad {
    pub fn inline(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self { path: path.into(), content: Some(content.into()), url: None }
    }

    pub fn remote(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self { path: path.into(), content: None, url: Some(url.into()) }
    }
}

/// Controller → executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    #[serde(rename_all = "camelCase")]
    Init {
        #[serde(default)]
        packages: Vec<String>,
        #[serde(default)]
        extra_install_packages: Vec<String>,
        #[serde(default)]
        files_to_load: Vec<FileToLoad>,
    },
    #[serde(rename_all = "camelCase")]
    Execute {
        filename: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<Namespace>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    InputResponse { input: String },
    #[serde(rename_all = "camelCase")]
    FsOperation {
        /// Kept as text so an unknown operation name becomes an `fs_error`
        /// rather than a malformed message.
        operation: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
}

impl ControllerMessage {
    const TYPES: &'static [&'static str] = &["init", "execute", "input_response", "fs_operation"];

    pub fn decode(value: Value) -> Result<Self, DecodeError> {
        decode_tagged(value, Self::TYPES)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Execute { .. } => "execute",
            Self::InputResponse { .. } => "input_response",
            Self::FsOperation { .. } => "fs_operation",
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Execute { request_id, .. } | Self::FsOperation { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

/// Terminal payload of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub filename: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub missive: Option<Value>,
    #[serde(default)]
    pub figures: Vec<String>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
    /// Elapsed wall time in milliseconds.
    pub time: u64,
    #[serde(default)]
    pub executed_with_namespace: bool,
}

/// Executor → controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorMessage {
    Ready,
    Result(ExecutionReport),
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    Warning { message: String },
    Info { message: String },
    InputRequired {
        #[serde(default)]
        prompt: String,
    },
    #[serde(rename_all = "camelCase")]
    FsResult {
        result: FsOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FsError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
}

impl ExecutorMessage {
    const TYPES: &'static [&'static str] = &[
        "ready",
        "result",
        "error",
        "warning",
        "info",
        "input_required",
        "fs_result",
        "fs_error",
    ];

    pub fn decode(value: Value) -> Result<Self, DecodeError> {
        decode_tagged(value, Self::TYPES)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
            Self::Info { .. } => "info",
            Self::InputRequired { .. } => "input_required",
            Self::FsResult { .. } => "fs_result",
            Self::FsError { .. } => "fs_error",
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Result(report) => report.request_id,
            Self::Error { request_id, .. }
            | Self::FsResult { request_id, .. }
            | Self::FsError { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Whether this message ends a correlated request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Result(_) | Self::Error { .. } | Self::FsResult { .. } | Self::FsError { .. }
        )
    }
}

/// Filesystem operations understood by the execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    WriteFile,
    ReadFile,
    Mkdir,
    Exists,
    Listdir,
}

impl FsOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WriteFile => "writeFile",
            Self::ReadFile => "readFile",
            Self::Mkdir => "mkdir",
            Self::Exists => "exists",
            Self::Listdir => "listdir",
        }
    }
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "writeFile" => Ok(Self::WriteFile),
            "readFile" => Ok(Self::ReadFile),
            "mkdir" => Ok(Self::Mkdir),
            "exists" => Ok(Self::Exists),
            "listdir" => Ok(Self::Listdir),
            other => Err(format!("Unknown FS operation: {other}")),
        }
    }
}

/// Payload of an `fs_result` message; its shape depends on the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FsOutcome {
    Content { content: String },
    Exists { exists: bool },
    Files { files: Vec<String> },
    Success { success: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid message format: expected object with 'type' property")]
    Malformed,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid '{kind}' message: {reason}")]
    Invalid { kind: String, reason: String },
}

fn decode_tagged<T: serde::de::DeserializeOwned>(
    value: Value,
    known: &[&str],
) -> Result<T, DecodeError> {
    let kind = match value.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind.clone(),
        _ => return Err(DecodeError::Malformed),
    };
    if !known.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Invalid { kind, reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_uses_camel_case_fields() {
        let msg = ControllerMessage::Init {
            packages: vec!["numpy".into()],
            extra_install_packages: vec![],
            files_to_load: vec![FileToLoad::inline("data/a.txt", "hi")],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "init");
        assert_eq!(value["extraInstallPackages"], json!([]));
        assert_eq!(value["filesToLoad"][0]["path"], "data/a.txt");
        assert!(value["filesToLoad"][0].get("url").is_none());
    }

    #[test]
    fn execute_omits_absent_namespace() {
        let msg = ControllerMessage::Execute {
            filename: "main.py".into(),
            code: "print(1)".into(),
            namespace: None,
            request_id: Some(7),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("namespace").is_none());
        assert_eq!(value["requestId"], 7);
    }

    #[test]
    fn decode_reports_missing_type() {
        let err = ControllerMessage::decode(json!({ "code": "x" })).unwrap_err();
        assert_eq!(err, DecodeError::Malformed);
        assert_eq!(
            err.to_string(),
            "Invalid message format: expected object with 'type' property"
        );
    }

    #[test]
    fn decode_reports_unknown_type() {
        let err = ControllerMessage::decode(json!({ "type": "shutdown" })).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: shutdown");
    }

    #[test]
    fn result_message_flattens_report() {
        let value = json!({
            "type": "result",
            "filename": "a.py",
            "stdout": "1\n",
            "stderr": "",
            "missive": { "x": 1 },
            "figures": [],
            "error": null,
            "time": 3,
            "requestId": 2
        });
        let msg = ExecutorMessage::decode(value).unwrap();
        assert!(msg.is_terminal());
        assert_eq!(msg.request_id(), Some(2));
        match msg {
            ExecutorMessage::Result(report) => {
                assert_eq!(report.missive, Some(json!({ "x": 1 })));
                assert!(report.error.is_none());
                assert!(!report.executed_with_namespace);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn fs_outcome_shapes() {
        let files: FsOutcome = serde_json::from_value(json!({ "files": ["a", "b"] })).unwrap();
        assert_eq!(files, FsOutcome::Files { files: vec!["a".into(), "b".into()] });
        let exists: FsOutcome = serde_json::from_value(json!({ "exists": false })).unwrap();
        assert_eq!(exists, FsOutcome::Exists { exists: false });
        let ok: FsOutcome = serde_json::from_value(json!({ "success": true })).unwrap();
        assert_eq!(ok, FsOutcome::Success { success: true });
    }

    #[test]
    fn fs_op_names_round_trip_through_text() {
        for op in [FsOp::WriteFile, FsOp::ReadFile, FsOp::Mkdir, FsOp::Exists, FsOp::Listdir] {
            assert_eq!(op.as_str().parse::<FsOp>(), Ok(op));
        }
        assert_eq!(
            "chmod".parse::<FsOp>().unwrap_err(),
            "Unknown FS operation: chmod"
        );
    }
}

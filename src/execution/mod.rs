//! Execution results and the per-controller history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::ExecutionReport;

/// Error kind reported when the runtime itself fails rather than user code.
pub const INTERNAL_ERROR_KIND: &str = "InternalError";

/// Failure raised by user code, named after the runtime's own exception type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(alias = "name")]
    pub kind: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR_KIND, message.to_string())
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one completed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub filename: String,
    /// Elapsed wall time in milliseconds.
    pub time: u64,
    pub stdout: String,
    pub stderr: String,
    pub missive: Option<Value>,
    /// Base64 encoded PNG images, in creation order.
    pub figures: Vec<String>,
    pub error: Option<ExecutionError>,
    pub timestamp: DateTime<Utc>,
    pub executed_with_namespace: bool,
}

impl ExecutionResult {
    pub fn from_report(report: ExecutionReport, timestamp: DateTime<Utc>) -> Self {
        Self {
            filename: report.filename,
            time: report.time,
            stdout: report.stdout,
            stderr: report.stderr,
            missive: report.missive,
            figures: report.figures,
            error: report.error,
            timestamp,
            executed_with_namespace: report.executed_with_namespace,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Append-only record of completed executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    entries: Vec<ExecutionResult>,
}

impl ExecutionHistory {
    pub fn push(&mut self, result: ExecutionResult) {
        self.entries.push(result);
    }

    pub fn entries(&self) -> &[ExecutionResult] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ExecutionResult> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

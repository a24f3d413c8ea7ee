//! Wire types exchanged with the calling pipeline.
//!
//! Field names are camelCase on the wire (`dataContext`, `isExpression`, ...)
//! so requests built by the grading and analytics services deserialize as-is.

use serde::{Deserialize, Serialize};

use crate::capabilities::Capability;

/// Status code for a successful run.
pub const STATUS_OK: i32 = 0;

/// Status code for any failed run (compile or runtime).
pub const STATUS_FAILED: i32 = 1;

/// One snippet invocation, built fresh per call by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Snippet source. Empty means "nothing to do".
    #[serde(default)]
    pub code: String,

    /// Bound inside the sandbox as `data`.
    #[serde(default)]
    pub data_context: serde_json::Value,

    /// Allowlist for this run. `None` = the configured default set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_capabilities: Option<Vec<Capability>>,

    /// Treat `code` as a single expression instead of a statement block.
    #[serde(default)]
    pub is_expression: bool,
}

impl ExecutionRequest {
    /// Statement-mode request: the value is whatever the snippet assigns to `result`.
    pub fn statements(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// Expression-mode request: the value is the expression itself.
    pub fn expression(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_expression: true,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data_context = data;
        self
    }

    pub fn with_capabilities<I>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.allowed_capabilities = Some(caps.into_iter().collect());
        self
    }
}

/// Normalized outcome of one run. Same shape whatever happened inside the snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Present only on success, and only when the entry point produced a value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// Captured console output in emission order. On failure the last entry
    /// is the stringified error.
    #[serde(default)]
    pub log: Vec<String>,

    /// `STATUS_OK` or `STATUS_FAILED`.
    pub status: i32,

    /// Console entries omitted because they could not be serialized.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped_log_entries: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl ExecutionResult {
    /// Result of an empty request: no log, status 0, no value.
    pub fn empty() -> Self {
        Self {
            value: None,
            log: Vec::new(),
            status: STATUS_OK,
            dropped_log_entries: 0,
        }
    }

    pub(crate) fn success(value: Option<serde_json::Value>, log: Vec<String>, dropped: usize) -> Self {
        Self {
            value,
            log,
            status: STATUS_OK,
            dropped_log_entries: dropped,
        }
    }

    pub(crate) fn failure(mut log: Vec<String>, error: String, dropped: usize) -> Self {
        log.push(error);
        Self {
            value: None,
            log,
            status: STATUS_FAILED,
            dropped_log_entries: dropped,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

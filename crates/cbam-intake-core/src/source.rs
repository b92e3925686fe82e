//! Row sources: where a batch of raw rows comes from.
//!
//! The orchestrator consumes a [`RowSource`] and never parses files or
//! HTTP bodies itself. [`NormalizeRequest`] is the JSON request shape
//! `{filename, data: [row, ...]}` and is a row source on its own; the app
//! crate adds a file-backed loader for the CLI.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{PipelineErrorKind, RawRow};

/// Request-shape problems, detected before any work is done.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowSourceError {
    #[error("request has no `data` rows")]
    Missing,
    #[error("request contains no rows")]
    Empty,
    #[error("row {0} is not a JSON object")]
    NotAnObject(usize),
    #[error("{0}")]
    Unreadable(String),
}

impl RowSourceError {
    pub fn kind(&self) -> PipelineErrorKind {
        match self {
            RowSourceError::Empty => PipelineErrorKind::EmptyRequest,
            _ => PipelineErrorKind::InvalidRequest,
        }
    }
}

/// A supplier of parsed spreadsheet rows.
pub trait RowSource: Send {
    fn filename(&self) -> &str;

    /// The rows, in spreadsheet order.
    fn rows(&self) -> Result<Vec<RawRow>, RowSourceError>;
}

/// Body of a normalize-and-stream request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeRequest {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub data: Option<Vec<serde_json::Value>>,
}

impl NormalizeRequest {
    pub fn new(filename: &str, rows: Vec<RawRow>) -> Self {
        Self {
            filename: filename.to_string(),
            data: Some(rows.into_iter().map(serde_json::Value::Object).collect()),
        }
    }
}

impl RowSource for NormalizeRequest {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn rows(&self) -> Result<Vec<RawRow>, RowSourceError> {
        let data = self.data.as_ref().ok_or(RowSourceError::Missing)?;
        if data.is_empty() {
            return Err(RowSourceError::Empty);
        }
        data.iter()
            .enumerate()
            .map(|(i, v)| v.as_object().cloned().ok_or(RowSourceError::NotAnObject(i)))
            .collect()
    }
}

/// SHA-256 over the filename and rows; identifies a request in logs and
/// in the `ai_request` event.
pub fn request_fingerprint(filename: &str, rows: &[RawRow]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    for row in rows {
        hasher.update(b"\n");
        hasher.update(serde_json::Value::Object(row.clone()).to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}

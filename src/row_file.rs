//! JSON file loader for `intake normalize`.
//!
//! Accepts either a bare array of row objects or the request shape
//! `{"filename": "...", "data": [...]}`. Without a `filename` the file's own
//! name is used.

use std::path::Path;

use anyhow::{bail, Context, Result};

use cbam_intake_core::source::NormalizeRequest;

pub fn load_request(path: &Path) -> Result<NormalizeRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rows file: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse rows file: {}", path.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut request = match value {
        serde_json::Value::Array(rows) => NormalizeRequest {
            filename: String::new(),
            data: Some(rows),
        },
        serde_json::Value::Object(_) => serde_json::from_value(value)
            .with_context(|| format!("Invalid request shape in {}", path.display()))?,
        _ => bail!(
            "{} must contain an array of rows or an object with a `data` array",
            path.display()
        ),
    };

    if request.filename.is_empty() {
        request.filename = file_name;
    }
    Ok(request)
}

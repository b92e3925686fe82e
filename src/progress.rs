//! CLI progress reporting for `intake normalize`.
//!
//! Progress is emitted on **stderr** so stdout stays parseable: the
//! `completed` payload is the only thing `intake normalize` prints to stdout.

use std::io::Write;
use std::str::FromStr;

use cbam_intake_core::models::ProgressEvent;

/// Receives every progress event of a job, in order.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "normalize  classifying 1,234 rows".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::Processing {
                message,
                total_rows,
            } => format!("normalize  {}  {} rows\n", message, format_number(*total_rows)),
            ProgressEvent::AiRequest { count, fingerprint } => format!(
                "normalize  classifying {} texts  [{}]\n",
                format_number(*count),
                fingerprint
            ),
            ProgressEvent::AiProcessed {
                matched,
                echoed,
                skipped,
            } => format!(
                "normalize  matched {}  echoed {}  skipped {}\n",
                format_number(*matched),
                format_number(*echoed),
                format_number(*skipped)
            ),
            ProgressEvent::Completed { rows, .. } => {
                format!("normalize  completed  {} rows\n", format_number(rows.len()))
            }
            ProgressEvent::Error { kind, message } => {
                format!("normalize  error ({})  {}\n", kind.as_str(), message)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
///
/// `completed` is abbreviated to its row count; the rows go to stdout.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = match event {
            ProgressEvent::Completed {
                job_id,
                filename,
                rows,
                ..
            } => serde_json::json!({
                "type": "completed",
                "job_id": job_id,
                "filename": filename,
                "rows": rows.len(),
            }),
            other => match serde_json::to_value(other) {
                Ok(v) => v,
                Err(_) => return,
            },
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    #[default]
    Human,
    Json,
}

impl ProgressMode {
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}' (expected human, json, or off)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn test_progress_mode_parse() {
        assert_eq!("json".parse::<ProgressMode>(), Ok(ProgressMode::Json));
        assert_eq!("OFF".parse::<ProgressMode>(), Ok(ProgressMode::Off));
        assert_eq!(ProgressMode::default(), ProgressMode::Human);
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}

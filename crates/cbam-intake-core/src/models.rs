//! Core data models used throughout CBAM Intake.
//!
//! These types represent the rows, classification results, feedback events,
//! and progress events that flow through the normalization and
//! classification pipeline.
//!
//! # Canonical schema
//!
//! | # | Column | Kind |
//! |---|--------|------|
//! | 1 | `lot_no` | text |
//! | 2 | `product_name` | text |
//! | 3 | `production_qty` | decimal, scale 2 |
//! | 4 | `input_date` | calendar date |
//! | 5 | `end_date` | calendar date |
//! | 6 | `process` | text |
//! | 7 | `material_text` | text (required for classification) |
//! | 8 | `quantity` | decimal, scale 6 |
//! | 9 | `unit` | unit token (defaults to `"t"`) |
//! | 10 | `ai_suggestion` | text, produced by the pipeline |
//!
//! The column names are the literal strings on the wire.

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// A raw spreadsheet row as received from the caller: column name → JSON value.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Default unit token substituted for blank units.
pub const DEFAULT_UNIT: &str = "t";

// ============ Canonical columns ============

/// One of the ten fixed canonical columns, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalColumn {
    LotNo,
    ProductName,
    ProductionQty,
    InputDate,
    EndDate,
    Process,
    MaterialText,
    Quantity,
    Unit,
    AiSuggestion,
}

/// Value type a canonical column is coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Date,
    /// Fixed-scale decimal. Blank or non-numeric input becomes zero when
    /// `zero_when_blank` is set, absent otherwise.
    Decimal { scale: u32, zero_when_blank: bool },
    Unit,
    /// Produced by the pipeline, never unified from input headers.
    Synthetic,
}

impl CanonicalColumn {
    /// All ten columns in declaration order.
    pub const ALL: [CanonicalColumn; 10] = [
        CanonicalColumn::LotNo,
        CanonicalColumn::ProductName,
        CanonicalColumn::ProductionQty,
        CanonicalColumn::InputDate,
        CanonicalColumn::EndDate,
        CanonicalColumn::Process,
        CanonicalColumn::MaterialText,
        CanonicalColumn::Quantity,
        CanonicalColumn::Unit,
        CanonicalColumn::AiSuggestion,
    ];

    /// The nine input columns (everything except `ai_suggestion`).
    pub const INPUT: [CanonicalColumn; 9] = [
        CanonicalColumn::LotNo,
        CanonicalColumn::ProductName,
        CanonicalColumn::ProductionQty,
        CanonicalColumn::InputDate,
        CanonicalColumn::EndDate,
        CanonicalColumn::Process,
        CanonicalColumn::MaterialText,
        CanonicalColumn::Quantity,
        CanonicalColumn::Unit,
    ];

    /// Wire name of the column.
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalColumn::LotNo => "lot_no",
            CanonicalColumn::ProductName => "product_name",
            CanonicalColumn::ProductionQty => "production_qty",
            CanonicalColumn::InputDate => "input_date",
            CanonicalColumn::EndDate => "end_date",
            CanonicalColumn::Process => "process",
            CanonicalColumn::MaterialText => "material_text",
            CanonicalColumn::Quantity => "quantity",
            CanonicalColumn::Unit => "unit",
            CanonicalColumn::AiSuggestion => "ai_suggestion",
        }
    }

    /// Look up a column by its exact wire name.
    pub fn from_name(name: &str) -> Option<CanonicalColumn> {
        CanonicalColumn::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == name)
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            CanonicalColumn::LotNo
            | CanonicalColumn::ProductName
            | CanonicalColumn::Process
            | CanonicalColumn::MaterialText => ColumnKind::Text,
            CanonicalColumn::InputDate | CanonicalColumn::EndDate => ColumnKind::Date,
            CanonicalColumn::ProductionQty => ColumnKind::Decimal {
                scale: 2,
                zero_when_blank: true,
            },
            CanonicalColumn::Quantity => ColumnKind::Decimal {
                scale: 6,
                zero_when_blank: true,
            },
            CanonicalColumn::Unit => ColumnKind::Unit,
            CanonicalColumn::AiSuggestion => ColumnKind::Synthetic,
        }
    }
}

impl std::fmt::Display for CanonicalColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire names of all ten canonical columns, in order.
pub fn canonical_column_names() -> Vec<String> {
    CanonicalColumn::ALL
        .iter()
        .map(|c| c.as_str().to_string())
        .collect()
}

// ============ Cell values ============

/// A typed cell value after normalization.
///
/// Serializes as JSON `null`, an ISO `YYYY-MM-DD` string, a fixed-scale
/// decimal string, or a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Absent,
    Date(NaiveDate),
    Decimal(Decimal),
    Text(String),
}

impl CellValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, CellValue::Absent)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            CellValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Render the cell back into the JSON value it serializes as.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Absent => serde_json::Value::Null,
            CellValue::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            CellValue::Decimal(d) => serde_json::Value::String(d.to_string()),
            CellValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

// ============ Rows ============

/// Whether a row takes part in classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Ready,
    Skipped { reason: String },
}

/// Diagnostic metadata stamped on a row after classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationMeta {
    pub confidence: f64,
    pub match_kind: MatchKind,
}

/// A row after header unification and value coercion.
///
/// `cells` always holds all ten canonical columns in declaration order.
/// Raw columns that were not bound to a canonical column are carried
/// verbatim in `passthrough`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    /// Zero-based position of the row in the incoming batch.
    pub index: usize,
    pub cells: IndexMap<CanonicalColumn, CellValue>,
    pub passthrough: IndexMap<String, serde_json::Value>,
    pub status: RowStatus,
    pub classification: Option<ClassificationMeta>,
}

impl CanonicalRow {
    /// An empty row: every canonical column absent.
    pub fn empty(index: usize) -> Self {
        let cells = CanonicalColumn::ALL
            .iter()
            .map(|c| (*c, CellValue::Absent))
            .collect();
        Self {
            index,
            cells,
            passthrough: IndexMap::new(),
            status: RowStatus::Ready,
            classification: None,
        }
    }

    pub fn get(&self, column: CanonicalColumn) -> &CellValue {
        self.cells.get(&column).unwrap_or(&CellValue::Absent)
    }

    pub fn set(&mut self, column: CanonicalColumn, value: CellValue) {
        self.cells.insert(column, value);
    }

    pub fn text(&self, column: CanonicalColumn) -> Option<&str> {
        self.get(column).as_text()
    }

    pub fn material_text(&self) -> Option<&str> {
        self.text(CanonicalColumn::MaterialText)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, RowStatus::Skipped { .. })
    }

    /// Stamp the classifier's answer onto the row.
    ///
    /// The suggestion is written regardless of confidence; the UI decides
    /// whether to accept or edit it.
    pub fn apply_classification(&mut self, result: &ClassificationResult) {
        self.set(
            CanonicalColumn::AiSuggestion,
            CellValue::Text(result.label.clone()),
        );
        self.classification = Some(ClassificationMeta {
            confidence: result.confidence,
            match_kind: result.match_kind,
        });
    }

    /// The row as a raw JSON object containing only canonical and
    /// pass-through columns. Feeding this back through normalization
    /// yields the same cells.
    pub fn to_raw(&self) -> RawRow {
        let mut raw = RawRow::new();
        for (column, value) in &self.cells {
            raw.insert(column.as_str().to_string(), value.to_json());
        }
        for (key, value) in &self.passthrough {
            raw.insert(key.clone(), value.clone());
        }
        raw
    }
}

impl Serialize for CanonicalRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for column in CanonicalColumn::ALL {
            map.serialize_entry(column.as_str(), self.get(column))?;
        }
        for (key, value) in &self.passthrough {
            map.serialize_entry(key, value)?;
        }
        if let Some(meta) = &self.classification {
            map.serialize_entry("ai_confidence", &meta.confidence)?;
            map.serialize_entry("ai_match_kind", &meta.match_kind)?;
        }
        if let RowStatus::Skipped { reason } = &self.status {
            map.serialize_entry("skipped", &true)?;
            map.serialize_entry("skip_reason", reason)?;
        }
        map.end()
    }
}

// ============ Classification ============

/// Provenance tag explaining why a classification result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    ExactLabel,
    ExactExemplar,
    ExactExemplarWhitespaceInsensitive,
    PrefixHeuristic,
    Similarity,
    None,
}

impl MatchKind {
    pub fn is_exact(&self) -> bool {
        matches!(
            self,
            MatchKind::ExactLabel
                | MatchKind::ExactExemplar
                | MatchKind::ExactExemplarWhitespaceInsensitive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::ExactLabel => "exact_label",
            MatchKind::ExactExemplar => "exact_exemplar",
            MatchKind::ExactExemplarWhitespaceInsensitive => {
                "exact_exemplar_whitespace_insensitive"
            }
            MatchKind::PrefixHeuristic => "prefix_heuristic",
            MatchKind::Similarity => "similarity",
            MatchKind::None => "none",
        }
    }
}

/// One scored label candidate from the similarity stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f64,
    pub best_match: String,
}

/// The classifier's answer for a single material text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    /// In `[0, 100]`.
    pub confidence: f64,
    pub best_match: String,
    pub match_kind: MatchKind,
    /// Top-k similarity candidates, best first. Empty for other stages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<LabelScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ClassificationResult {
    pub fn exact_label(text: &str) -> Self {
        Self {
            label: text.to_string(),
            confidence: 100.0,
            best_match: text.to_string(),
            match_kind: MatchKind::ExactLabel,
            alternatives: Vec::new(),
            note: None,
        }
    }

    pub fn exact_exemplar(label: &str, exemplar: &str, kind: MatchKind) -> Self {
        Self {
            label: label.to_string(),
            confidence: 100.0,
            best_match: exemplar.to_string(),
            match_kind: kind,
            alternatives: Vec::new(),
            note: None,
        }
    }

    pub fn prefix_heuristic(label: &str, exemplar: &str) -> Self {
        Self {
            label: label.to_string(),
            confidence: 95.0,
            best_match: exemplar.to_string(),
            match_kind: MatchKind::PrefixHeuristic,
            alternatives: Vec::new(),
            note: None,
        }
    }

    /// Build a similarity result from ranked candidates (best first).
    ///
    /// Returns `None` when `ranked` is empty.
    pub fn similarity(ranked: Vec<LabelScore>) -> Option<Self> {
        let best = ranked.first()?.clone();
        Some(Self {
            label: best.label,
            confidence: best.confidence,
            best_match: best.best_match,
            match_kind: MatchKind::Similarity,
            alternatives: ranked,
            note: None,
        })
    }

    /// Echo the input: nothing cleared the threshold.
    pub fn no_match(text: &str) -> Self {
        Self {
            label: text.to_string(),
            confidence: 0.0,
            best_match: String::new(),
            match_kind: MatchKind::None,
            alternatives: Vec::new(),
            note: None,
        }
    }

    /// Empty input text.
    pub fn empty() -> Self {
        Self::no_match("")
    }

    /// The corpus has no labels at all; the input is echoed back as-is.
    pub fn no_training_data(text: &str) -> Self {
        Self {
            label: text.to_string(),
            confidence: 100.0,
            best_match: text.to_string(),
            match_kind: MatchKind::None,
            alternatives: Vec::new(),
            note: Some("no training data".to_string()),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// True when the suggestion is an actual label rather than an echo.
    pub fn is_match(&self) -> bool {
        self.match_kind != MatchKind::None
    }
}

// ============ Feedback ============

/// A user correction (or confirmation) of a suggested label. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub material_text: String,
    pub corrected_label: String,
    pub was_correct: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub process_context: Option<String>,
    #[serde(default)]
    pub product_context: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackEvent {
    pub fn new(material_text: &str, corrected_label: &str, was_correct: bool) -> Self {
        Self {
            material_text: material_text.to_string(),
            corrected_label: corrected_label.to_string(),
            was_correct,
            note: None,
            process_context: None,
            product_context: None,
            timestamp: Utc::now(),
        }
    }
}

// ============ Progress events ============

/// Machine-readable tag carried by terminal `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    InvalidRequest,
    EmptyRequest,
    ResultCountMismatch,
    Timeout,
    Internal,
}

impl PipelineErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineErrorKind::InvalidRequest => "invalid_request",
            PipelineErrorKind::EmptyRequest => "empty_request",
            PipelineErrorKind::ResultCountMismatch => "result_count_mismatch",
            PipelineErrorKind::Timeout => "timeout",
            PipelineErrorKind::Internal => "internal",
        }
    }
}

/// A single event streamed to the progress sink.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"processing","message":"preprocessing","total_rows":3}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Processing {
        message: String,
        total_rows: usize,
    },
    AiRequest {
        count: usize,
        fingerprint: String,
    },
    AiProcessed {
        matched: usize,
        echoed: usize,
        skipped: usize,
    },
    Completed {
        job_id: String,
        filename: String,
        rows: Vec<CanonicalRow>,
        columns: Vec<String>,
    },
    Error {
        kind: PipelineErrorKind,
        message: String,
    },
}

impl ProgressEvent {
    pub fn error(kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            kind,
            message: message.into(),
        }
    }

    /// `completed` and `error` close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Error { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ProgressEvent::Processing { .. } => "processing",
            ProgressEvent::AiRequest { .. } => "ai_request",
            ProgressEvent::AiProcessed { .. } => "ai_processed",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Error { .. } => "error",
        }
    }
}

// ============ Batch jobs ============

/// Lifecycle of a [`BatchJob`]. Terminal on `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    HeaderMapped,
    Classifying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-request processing state, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub job_id: String,
    pub filename: String,
    pub rows: Vec<CanonicalRow>,
    pub header_map: crate::header::HeaderMap,
    pub status: JobStatus,
    /// Number of progress events emitted so far.
    pub progress_cursor: usize,
}

impl BatchJob {
    pub fn new(filename: &str) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            rows: Vec::new(),
            header_map: crate::header::HeaderMap::default(),
            status: JobStatus::Pending,
            progress_cursor: 0,
        }
    }

    /// Move to `next`. Status only moves forward, and nothing leaves a
    /// terminal state; returns `false` when the transition is refused.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if next == JobStatus::Failed || next > self.status {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Record that an event was handed to the sink and return it.
    pub fn emit(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.progress_cursor += 1;
        event
    }
}

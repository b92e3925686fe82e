//! Streaming orchestrator: one batch through header unification, row
//! normalization and classification, reported as a stream of progress events.
//!
//! # Event sequence
//!
//! ```text
//! processing{total_rows} → ai_request{count, fingerprint}
//!     → ai_processed{matched, echoed, skipped} → completed{rows, columns}
//! ```
//!
//! Any batch-level failure replaces the remainder of the sequence with a
//! single `error{kind, message}`. Exactly one terminal event is produced,
//! and it is always last:
//!
//! | Failure | Terminal event | Classifier called? |
//! |---------|----------------|--------------------|
//! | missing / malformed `data` | `error{invalid_request}` | no |
//! | zero rows | `error{empty_request}` | no |
//! | classifier answered with the wrong count | `error{result_count_mismatch}` | yes |
//! | deadline expired | `error{timeout}` | in flight, dropped |
//!
//! # Cancellation
//!
//! The stream is lazy. Dropping it (an SSE client disconnecting) drops the
//! in-flight classification future. A [`CancellationToken`] passed to
//! [`Orchestrator::process_with_cancel`] ends the stream at the next
//! suspension point without a terminal event.
//!
//! # Persistence
//!
//! [`Orchestrator::persist`] is a separate operation over a completed batch.
//! Rows are re-normalized (normalization is idempotent), the unit default is
//! enforced again, and the whole batch is written in one transaction.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use cbam_intake_core::classify::BatchClassifier;
use cbam_intake_core::header::{collect_header, unify};
use cbam_intake_core::models::{
    canonical_column_names, BatchJob, JobStatus, PipelineErrorKind, ProgressEvent, RawRow,
};
use cbam_intake_core::normalize::RowNormalizer;
use cbam_intake_core::source::{request_fingerprint, RowSource};
use cbam_intake_core::store::{PersistBatch, PersistedRecord, RecordStore};

/// Drives batches through the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    classifier: Arc<dyn BatchClassifier>,
    store: Arc<dyn RecordStore>,
    normalizer: RowNormalizer,
    deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        classifier: Arc<dyn BatchClassifier>,
        store: Arc<dyn RecordStore>,
        normalizer: RowNormalizer,
        deadline: Duration,
    ) -> Self {
        Self {
            classifier,
            store,
            normalizer,
            deadline,
        }
    }

    pub fn classifier(&self) -> &Arc<dyn BatchClassifier> {
        &self.classifier
    }

    /// Process one batch. See the module docs for the event sequence.
    pub fn process<S>(&self, source: S) -> impl Stream<Item = ProgressEvent> + Send + 'static
    where
        S: RowSource + 'static,
    {
        self.process_with_cancel(source, CancellationToken::new())
    }

    /// Like [`process`](Self::process), stopping early once `cancel` fires.
    pub fn process_with_cancel<S>(
        &self,
        source: S,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ProgressEvent> + Send + 'static
    where
        S: RowSource + 'static,
    {
        let this = self.clone();

        async_stream::stream! {
            let deadline = Instant::now() + this.deadline;
            let mut job = BatchJob::new(source.filename());
            tracing::info!(job_id = %job.job_id, filename = %job.filename, "job started");

            let raw_rows: Vec<RawRow> = match source.rows() {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(job_id = %job.job_id, error = %e, "request rejected");
                    job.advance(JobStatus::Failed);
                    yield job.emit(ProgressEvent::error(e.kind(), e.to_string()));
                    return;
                }
            };

            yield job.emit(ProgressEvent::Processing {
                message: "preprocessing".to_string(),
                total_rows: raw_rows.len(),
            });

            let header = collect_header(&raw_rows);
            job.header_map = unify(&header);
            job.advance(JobStatus::HeaderMapped);
            job.rows = this.normalizer.normalize_all(&raw_rows, &job.header_map);

            // Rows without material text are carried through unclassified.
            let pending: Vec<usize> = job
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| !row.is_skipped())
                .map(|(i, _)| i)
                .collect();
            let texts: Vec<String> = pending
                .iter()
                .map(|&i| job.rows[i].material_text().unwrap_or_default().to_string())
                .collect();
            let skipped = job.rows.len() - pending.len();

            if cancel.is_cancelled() {
                tracing::info!(job_id = %job.job_id, "job cancelled before classification");
                return;
            }

            job.advance(JobStatus::Classifying);
            yield job.emit(ProgressEvent::AiRequest {
                count: texts.len(),
                fingerprint: request_fingerprint(&job.filename, &raw_rows),
            });

            let results = if texts.is_empty() {
                Vec::new()
            } else {
                let classify = timeout_at(deadline, this.classifier.classify_batch(&texts));
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    outcome = classify => Some(outcome),
                };
                match outcome {
                    None => {
                        tracing::info!(job_id = %job.job_id, "job cancelled during classification");
                        return;
                    }
                    Some(Ok(results)) => results,
                    Some(Err(_)) => {
                        tracing::warn!(job_id = %job.job_id, "batch deadline expired");
                        job.advance(JobStatus::Failed);
                        yield job.emit(ProgressEvent::error(
                            PipelineErrorKind::Timeout,
                            format!("batch exceeded its deadline of {:?}", this.deadline),
                        ));
                        return;
                    }
                }
            };

            if results.len() != texts.len() {
                tracing::error!(
                    job_id = %job.job_id,
                    expected = texts.len(),
                    got = results.len(),
                    "classifier result count mismatch"
                );
                job.advance(JobStatus::Failed);
                yield job.emit(ProgressEvent::error(
                    PipelineErrorKind::ResultCountMismatch,
                    format!(
                        "classifier returned {} results for {} texts",
                        results.len(),
                        texts.len()
                    ),
                ));
                return;
            }

            let mut matched = 0;
            for (&i, result) in pending.iter().zip(&results) {
                if result.is_match() {
                    matched += 1;
                }
                job.rows[i].apply_classification(result);
            }
            let echoed = results.len() - matched;

            yield job.emit(ProgressEvent::AiProcessed {
                matched,
                echoed,
                skipped,
            });

            if cancel.is_cancelled() {
                tracing::info!(job_id = %job.job_id, "job cancelled before completion");
                return;
            }

            job.advance(JobStatus::Completed);
            tracing::info!(
                job_id = %job.job_id,
                rows = job.rows.len(),
                matched,
                echoed,
                skipped,
                events = job.progress_cursor + 1,
                "job completed"
            );
            let rows = std::mem::take(&mut job.rows);
            yield job.emit(ProgressEvent::Completed {
                job_id: job.job_id.clone(),
                filename: job.filename.clone(),
                rows,
                columns: canonical_column_names(),
            });
        }
    }

    /// Write a completed batch in a single transaction.
    pub async fn persist(&self, request: PersistRequest) -> PersistResponse {
        let rows = match request.raw_rows() {
            Ok(rows) => rows,
            Err((kind, message)) => return PersistResponse::rejected(kind, message),
        };

        let header = if request.columns.is_empty() {
            collect_header(&rows)
        } else {
            request.columns.clone()
        };
        let header_map = unify(&header);
        let default_unit = self.normalizer.params().default_unit.clone();
        let records: Vec<PersistedRecord> = self
            .normalizer
            .normalize_all(&rows, &header_map)
            .iter()
            .map(|row| PersistedRecord::from_row(row, &default_unit))
            .collect();

        let batch = PersistBatch::new(&request.filename, records);
        match self.store.save_batch(&batch).await {
            Ok(saved) => {
                tracing::info!(batch_id = %batch.batch_id, saved, "batch persisted");
                PersistResponse {
                    success: true,
                    saved_count: saved,
                    message: format!("saved {} rows", saved),
                    error: None,
                    error_kind: None,
                    retryable: None,
                }
            }
            Err(e) => {
                tracing::warn!(batch_id = %batch.batch_id, error = %e, "batch persist failed");
                PersistResponse {
                    success: false,
                    saved_count: 0,
                    message: "batch was not saved; no rows were written".to_string(),
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind().as_str().to_string()),
                    retryable: Some(e.is_retryable()),
                }
            }
        }
    }
}

// ============ Persist wire types ============

/// Body of a persist request: rows as returned in `completed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistRequest {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl PersistRequest {
    fn raw_rows(&self) -> Result<Vec<RawRow>, (PipelineErrorKind, String)> {
        if self.data.is_empty() {
            return Err((
                PipelineErrorKind::EmptyRequest,
                "request contains no rows".to_string(),
            ));
        }
        self.data
            .iter()
            .enumerate()
            .map(|(i, value)| match value {
                serde_json::Value::Object(map) => Ok(map.clone()),
                _ => Err((
                    PipelineErrorKind::InvalidRequest,
                    format!("row {} is not a JSON object", i),
                )),
            })
            .collect()
    }
}

/// Outcome of [`Orchestrator::persist`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistResponse {
    pub success: bool,
    pub saved_count: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `conflict`, `transient`, `fatal`, or a request-shape kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl PersistResponse {
    fn rejected(kind: PipelineErrorKind, message: String) -> Self {
        Self {
            success: false,
            saved_count: 0,
            message: "request rejected".to_string(),
            error: Some(message),
            error_kind: Some(kind.as_str().to_string()),
            retryable: Some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cbam_intake_core::models::ClassificationResult;
    use cbam_intake_core::source::NormalizeRequest;
    use cbam_intake_core::store::memory::InMemoryRecordStore;
    use cbam_intake_core::store::PersistError;
    use futures::StreamExt;

    struct EchoClassifier;

    #[async_trait]
    impl BatchClassifier for EchoClassifier {
        async fn classify_batch(&self, texts: &[String]) -> Vec<ClassificationResult> {
            texts.iter().map(|t| ClassificationResult::no_match(t)).collect()
        }

        fn corpus_version(&self) -> u64 {
            1
        }
    }

    struct SlowClassifier;

    #[async_trait]
    impl BatchClassifier for SlowClassifier {
        async fn classify_batch(&self, texts: &[String]) -> Vec<ClassificationResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            texts.iter().map(|t| ClassificationResult::no_match(t)).collect()
        }

        fn corpus_version(&self) -> u64 {
            1
        }
    }

    fn orchestrator(
        classifier: Arc<dyn BatchClassifier>,
        deadline: Duration,
    ) -> (Orchestrator, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let orch = Orchestrator::new(classifier, store.clone(), RowNormalizer::default(), deadline);
        (orch, store)
    }

    fn row(value: serde_json::Value) -> RawRow {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_skipped_rows_are_not_classified() {
        let (orch, _) = orchestrator(Arc::new(EchoClassifier), Duration::from_secs(5));
        let request = NormalizeRequest::new(
            "a.xlsx",
            vec![
                row(serde_json::json!({"material_text": "coke"})),
                row(serde_json::json!({"material_text": "  "})),
            ],
        );
        let events: Vec<ProgressEvent> = orch.process(request).collect().await;
        assert_eq!(events.len(), 4);
        match &events[1] {
            ProgressEvent::AiRequest { count, fingerprint } => {
                assert_eq!(*count, 1);
                assert_eq!(fingerprint.len(), 16);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[2] {
            ProgressEvent::AiProcessed {
                matched,
                echoed,
                skipped,
            } => assert_eq!((*matched, *echoed, *skipped), (0, 1, 1)),
            other => panic!("unexpected {:?}", other),
        }
        match &events[3] {
            ProgressEvent::Completed { rows, columns, .. } => {
                assert_eq!(rows.len(), 2);
                assert!(rows[1].is_skipped());
                assert_eq!(columns.len(), 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_emits_timeout() {
        let (orch, _) = orchestrator(Arc::new(SlowClassifier), Duration::from_millis(50));
        let request =
            NormalizeRequest::new("a.xlsx", vec![row(serde_json::json!({"material_text": "x"}))]);
        let events: Vec<ProgressEvent> = orch.process(request).collect().await;
        let last = events.last().unwrap();
        assert!(matches!(
            last,
            ProgressEvent::Error {
                kind: PipelineErrorKind::Timeout,
                ..
            }
        ));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_terminal_event() {
        let (orch, _) = orchestrator(Arc::new(SlowClassifier), Duration::from_secs(120));
        let cancel = CancellationToken::new();
        let request =
            NormalizeRequest::new("a.xlsx", vec![row(serde_json::json!({"material_text": "x"}))]);
        let mut stream = Box::pin(orch.process_with_cancel(request, cancel.clone()));

        assert_eq!(stream.next().await.unwrap().kind_name(), "processing");
        assert_eq!(stream.next().await.unwrap().kind_name(), "ai_request");
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_persist_rejects_empty_and_non_objects() {
        let (orch, store) = orchestrator(Arc::new(EchoClassifier), Duration::from_secs(5));

        let empty = orch.persist(PersistRequest::default()).await;
        assert!(!empty.success);
        assert_eq!(empty.error_kind.as_deref(), Some("empty_request"));

        let bad = orch
            .persist(PersistRequest {
                filename: "a.xlsx".into(),
                data: vec![serde_json::json!(1)],
                columns: vec![],
            })
            .await;
        assert_eq!(bad.error_kind.as_deref(), Some("invalid_request"));
        assert_eq!(store.save_calls(), 0);
    }

    #[tokio::test]
    async fn test_persist_reports_transient_failure() {
        let (orch, store) = orchestrator(Arc::new(EchoClassifier), Duration::from_secs(5));
        store.inject_failure(PersistError::Transient("database is locked".into()));

        let response = orch
            .persist(PersistRequest {
                filename: "a.xlsx".into(),
                data: vec![serde_json::json!({"material_text": "coke", "unit": ""})],
                columns: canonical_column_names(),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.error_kind.as_deref(), Some("transient"));
        assert_eq!(response.retryable, Some(true));
        assert!(store.records().is_empty());
    }
}

//! Service wiring shared by the CLI and the HTTP server.
//!
//! ```text
//! seed file ─┐
//!            ├─▶ FeedbackStore ──▶ CorpusHandle (v1) ──▶ Classifier ──▶ Orchestrator
//! JSONL log ─┘                                                              │
//!                                                               RecordStore ┘
//! ```
//!
//! The feedback store is the only writer of the corpus; the classifier
//! reads snapshots from the same handle.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use cbam_intake_core::classify::Classifier;
use cbam_intake_core::corpus::{CorpusSeed, TrainingCorpus};
use cbam_intake_core::feedback::{FeedbackLog, FeedbackStore};
use cbam_intake_core::normalize::RowNormalizer;
use cbam_intake_core::store::memory::InMemoryRecordStore;
use cbam_intake_core::store::RecordStore;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::feedback_log::JsonlFeedbackLog;
use crate::pipeline::Orchestrator;
use crate::sqlite_store::SqliteRecordStore;

pub struct Services {
    pub config: Arc<Config>,
    pub feedback: Arc<FeedbackStore>,
    pub classifier: Arc<Classifier>,
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn RecordStore>,
}

impl Services {
    /// Full wiring: SQLite record store and the configured feedback log.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::create_schema(&pool).await?;
        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));
        let log = Arc::new(JsonlFeedbackLog::new(&config.corpus.feedback_log));
        Self::assemble(config, store, log).await
    }

    /// Wiring without a database; records are kept in memory.
    pub async fn open_without_db(config: &Config) -> Result<Self> {
        let log = Arc::new(JsonlFeedbackLog::new(&config.corpus.feedback_log));
        Self::assemble(config, Arc::new(InMemoryRecordStore::new()), log).await
    }

    pub async fn assemble(
        config: &Config,
        store: Arc<dyn RecordStore>,
        log: Arc<dyn FeedbackLog>,
    ) -> Result<Self> {
        let seed = load_seed(config.corpus.seed_path.as_deref())?;
        let feedback = Arc::new(FeedbackStore::open(seed, log).await?);

        let embedder = create_embedder(&config.embedding)?;
        tracing::info!(model = embedder.model_name(), "embedding provider ready");

        let classifier = Arc::new(Classifier::new(
            feedback.handle(),
            embedder,
            config.classifier_params(),
        ));
        let orchestrator = Orchestrator::new(
            classifier.clone(),
            store.clone(),
            RowNormalizer::new(config.normalize_params()),
            config.batch_deadline(),
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            feedback,
            classifier,
            orchestrator,
            store,
        })
    }
}

/// Read the seed corpus; no path means an empty corpus.
pub fn load_seed(path: Option<&Path>) -> Result<TrainingCorpus> {
    let Some(path) = path else {
        return Ok(TrainingCorpus::new());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus seed: {}", path.display()))?;
    let seed = CorpusSeed::from_json(&content)
        .with_context(|| format!("Invalid corpus seed: {}", path.display()))?;
    let corpus = TrainingCorpus::from_seed(&seed);
    tracing::info!(
        path = %path.display(),
        labels = corpus.label_count(),
        exemplars = corpus.exemplar_count(),
        "loaded corpus seed"
    );
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbam_intake_core::classify::BatchClassifier;
    use cbam_intake_core::feedback::MemoryFeedbackLog;
    use cbam_intake_core::models::{FeedbackEvent, MatchKind};
    use tempfile::TempDir;

    #[test]
    fn test_load_seed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("labels.json");
        std::fs::write(
            &path,
            r#"{"labels":[{"id":"coke","name":"Coke","exemplars":["met coke"]}]}"#,
        )
        .unwrap();

        let corpus = load_seed(Some(&path)).unwrap();
        assert_eq!(corpus.label_count(), 1);
        assert!(corpus.contains_exemplar("coke", "met coke"));
        assert!(load_seed(None).unwrap().is_empty());
        assert!(load_seed(Some(&tmp.path().join("missing.json"))).is_err());
    }

    #[tokio::test]
    async fn test_feedback_reaches_classifier() {
        let config = Config::minimal();
        let log = Arc::new(MemoryFeedbackLog::new());
        let services = Services::assemble(&config, Arc::new(InMemoryRecordStore::new()), log)
            .await
            .unwrap();
        assert_eq!(services.classifier.corpus_version(), 1);

        services
            .feedback
            .submit(FeedbackEvent::new("휘발유", "gasoline", false))
            .await
            .unwrap();

        let result = services.classifier.classify("휘발유").await;
        assert_eq!(result.label, "gasoline");
        assert_eq!(result.match_kind, MatchKind::ExactExemplar);
        assert_eq!(services.classifier.corpus_version(), 2);
    }
}

//! Feedback ingestion: user corrections flow back into the training corpus.
//!
//! # Submission
//!
//! ```text
//!  submit(event)
//!    │ validate ─────────────────────────────▶ Rejected
//!    │ lock writer (one submission at a time)
//!    │ append event to the log ──── failure ─▶ Log (corpus untouched)
//!    └ CorpusHandle::update: apply event to a copy of the current
//!      snapshot, publish the copy if the corpus changed
//! ```
//!
//! The store keeps no private copy of the corpus. Each event is applied to
//! whatever snapshot is current at publication time, so a corpus installed
//! with [`Classifier::swap_corpus`](crate::classify::Classifier::swap_corpus)
//! is extended by later feedback, never replaced by it.
//!
//! The log is authoritative: at startup [`FeedbackStore::open`] replays it
//! over the seed corpus, applying the same mutation `submit` would.
//!
//! Both corrections (`was_correct = false`) and confirmations
//! (`was_correct = true`) add the text as an exemplar of the label unless
//! it is already present after trimming, so repeated confirmations leave
//! the corpus unchanged and publish nothing.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::corpus::{CorpusHandle, TrainingCorpus};
use crate::models::FeedbackEvent;

/// Why a submission failed.
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    /// The event is malformed; nothing was written.
    #[error("feedback rejected: {0}")]
    Rejected(String),
    /// The log write failed; the corpus is unchanged.
    #[error("failed to write feedback log: {0}")]
    Log(String),
}

/// Acknowledgement of a durably logged submission.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackAck {
    pub timestamp: DateTime<Utc>,
    pub corpus_changed: bool,
    pub corpus_version: u64,
}

/// Durable, append-only record of feedback events.
#[async_trait]
pub trait FeedbackLog: Send + Sync {
    /// Append one event. Must be durable when it returns `Ok`.
    async fn append(&self, event: &FeedbackEvent) -> Result<()>;

    /// All logged events in arrival order.
    async fn replay(&self) -> Result<Vec<FeedbackEvent>>;
}

/// In-memory [`FeedbackLog`] for tests.
#[derive(Default)]
pub struct MemoryFeedbackLog {
    events: Mutex<Vec<FeedbackEvent>>,
    fail_appends: Mutex<bool>,
}

impl MemoryFeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.fail_appends.lock().unwrap() = failing;
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedbackLog for MemoryFeedbackLog {
    async fn append(&self, event: &FeedbackEvent) -> Result<()> {
        if *self.fail_appends.lock().unwrap() {
            anyhow::bail!("feedback log unavailable");
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<FeedbackEvent>> {
        Ok(self.events())
    }
}

/// Apply one event to a corpus. Returns `true` if the corpus changed.
pub fn apply_event(corpus: &mut TrainingCorpus, event: &FeedbackEvent) -> bool {
    corpus.add_exemplar(&event.corrected_label, &event.material_text)
}

fn validate(event: &FeedbackEvent) -> Result<(), FeedbackError> {
    if event.material_text.trim().is_empty() {
        return Err(FeedbackError::Rejected("material_text is empty".into()));
    }
    if event.corrected_label.trim().is_empty() {
        return Err(FeedbackError::Rejected("corrected_label is empty".into()));
    }
    Ok(())
}

/// Sole writer of the training corpus.
pub struct FeedbackStore {
    handle: Arc<CorpusHandle>,
    log: Arc<dyn FeedbackLog>,
    writer: futures::lock::Mutex<()>,
}

impl FeedbackStore {
    /// Replay `log` over `seed` and publish the result as snapshot version 1.
    pub async fn open(seed: TrainingCorpus, log: Arc<dyn FeedbackLog>) -> Result<Self> {
        let mut corpus = seed;
        let events = log.replay().await?;
        let mut applied = 0usize;
        for event in &events {
            if validate(event).is_ok() && apply_event(&mut corpus, event) {
                applied += 1;
            }
        }
        tracing::info!(
            events = events.len(),
            applied,
            labels = corpus.label_count(),
            exemplars = corpus.exemplar_count(),
            "replayed feedback log"
        );

        Ok(Self {
            handle: Arc::new(CorpusHandle::new(corpus)),
            log,
            writer: futures::lock::Mutex::new(()),
        })
    }

    /// Handle shared with classifiers.
    pub fn handle(&self) -> Arc<CorpusHandle> {
        self.handle.clone()
    }

    /// Log `event` and fold it into the corpus.
    pub async fn submit(&self, event: FeedbackEvent) -> Result<FeedbackAck, FeedbackError> {
        validate(&event)?;

        let _writer = self.writer.lock().await;

        if let Err(e) = self.log.append(&event).await {
            tracing::error!(error = %e, "feedback log append failed");
            return Err(FeedbackError::Log(format!("{e:#}")));
        }

        let published = self.handle.update(|corpus| apply_event(corpus, &event));
        let changed = published.is_some();
        let corpus_version = published.unwrap_or_else(|| self.handle.version());

        tracing::info!(
            label = %event.corrected_label,
            was_correct = event.was_correct,
            changed,
            corpus_version,
            "feedback accepted"
        );

        Ok(FeedbackAck {
            timestamp: event.timestamp,
            corpus_changed: changed,
            corpus_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn seed() -> TrainingCorpus {
        let mut c = TrainingCorpus::new();
        c.add_exemplar("coke", "met coke");
        c
    }

    fn open(log: Arc<MemoryFeedbackLog>) -> FeedbackStore {
        block_on(FeedbackStore::open(seed(), log)).unwrap()
    }

    #[test]
    fn test_correction_adds_exemplar_and_publishes() {
        let log = Arc::new(MemoryFeedbackLog::new());
        let store = open(log.clone());
        let handle = store.handle();

        let ack = block_on(store.submit(FeedbackEvent::new("휘발유", "gasoline", false))).unwrap();
        assert!(ack.corpus_changed);
        assert_eq!(ack.corpus_version, 2);
        assert!(handle.load().corpus().contains_exemplar("gasoline", "휘발유"));
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn test_confirmation_is_idempotent() {
        let log = Arc::new(MemoryFeedbackLog::new());
        let store = open(log.clone());

        let first = block_on(store.submit(FeedbackEvent::new("coke nut", "coke", true))).unwrap();
        let second = block_on(store.submit(FeedbackEvent::new(" coke nut ", "coke", true))).unwrap();
        assert!(first.corpus_changed);
        assert!(!second.corpus_changed);
        assert_eq!(first.corpus_version, second.corpus_version);
        // Every submission is logged, duplicates included.
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn test_log_failure_leaves_corpus_untouched() {
        let log = Arc::new(MemoryFeedbackLog::new());
        let store = open(log.clone());
        let handle = store.handle();

        log.set_failing(true);
        let err = block_on(store.submit(FeedbackEvent::new("휘발유", "gasoline", false))).unwrap_err();
        assert!(matches!(err, FeedbackError::Log(_)));
        assert_eq!(handle.version(), 1);
        assert!(!handle.load().corpus().contains_label("gasoline"));

        // The rolled-back mutation does not leak into the next submission.
        log.set_failing(false);
        block_on(store.submit(FeedbackEvent::new("coke nut", "coke", true))).unwrap();
        assert!(!handle.load().corpus().contains_label("gasoline"));
    }

    #[test]
    fn test_submit_keeps_swapped_corpus() {
        let log = Arc::new(MemoryFeedbackLog::new());
        let store = open(log);
        let handle = store.handle();

        let mut swapped = TrainingCorpus::new();
        swapped.add_exemplar("slag", "bf slag");
        assert_eq!(handle.publish(swapped), 2);

        let ack = block_on(store.submit(FeedbackEvent::new("휘발유", "gasoline", false))).unwrap();
        assert_eq!(ack.corpus_version, 3);
        let snapshot = handle.load();
        assert!(snapshot.corpus().contains_exemplar("slag", "bf slag"));
        assert!(snapshot.corpus().contains_exemplar("gasoline", "휘발유"));
        assert!(!snapshot.corpus().contains_label("coke"));
    }

    #[test]
    fn test_rejects_blank_fields() {
        let log = Arc::new(MemoryFeedbackLog::new());
        let store = open(log.clone());
        let err = block_on(store.submit(FeedbackEvent::new("  ", "coke", false))).unwrap_err();
        assert!(matches!(err, FeedbackError::Rejected(_)));
        let err = block_on(store.submit(FeedbackEvent::new("coke", "", false))).unwrap_err();
        assert!(matches!(err, FeedbackError::Rejected(_)));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_open_replays_log() {
        let log = Arc::new(MemoryFeedbackLog::new());
        block_on(log.append(&FeedbackEvent::new("휘발유", "gasoline", false))).unwrap();
        block_on(log.append(&FeedbackEvent::new("pig iron", "iron", true))).unwrap();

        let store = open(log);
        let snapshot = store.handle().load();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.corpus().contains_exemplar("gasoline", "휘발유"));
        assert!(snapshot.corpus().contains_exemplar("iron", "pig iron"));
        assert!(snapshot.corpus().contains_exemplar("coke", "met coke"));
    }
}

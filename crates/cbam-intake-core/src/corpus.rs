//! Training corpus and immutable snapshots.
//!
//! The [`TrainingCorpus`] maps each label to an insertion-ordered set of
//! exemplars. It is owned by the feedback store; classifiers only ever see
//! a [`CorpusSnapshot`], an immutable copy with pre-built lookup tables.
//!
//! # Publication
//!
//! ```text
//!  FeedbackStore ──clone──▶ TrainingCorpus' ──publish──▶ CorpusHandle
//!                                                          │
//!            Classifier::classify_batch ◀──load (Arc)──────┘
//! ```
//!
//! [`CorpusHandle::publish`] swaps the snapshot pointer under a write lock
//! ([`CorpusHandle::update`] also derives the next corpus under it),
//! so a reader that called [`CorpusHandle::load`] keeps a consistent view
//! for as long as it holds the `Arc`. Versions increase by exactly one per
//! publish.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// A controlled-vocabulary label and its exemplars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelEntry {
    pub id: String,
    pub name: String,
    pub exemplars: IndexSet<String>,
}

/// Label → exemplars, both in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingCorpus {
    labels: IndexMap<String, LabelEntry>,
}

impl TrainingCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a corpus from a seed document.
    pub fn from_seed(seed: &CorpusSeed) -> Self {
        let mut corpus = Self::new();
        for label in &seed.labels {
            corpus.add_label(&label.id, label.name.as_deref().unwrap_or(&label.id));
            for exemplar in &label.exemplars {
                corpus.add_exemplar(&label.id, exemplar);
            }
        }
        corpus
    }

    /// Register a label. An existing label keeps its name and exemplars.
    ///
    /// Returns `true` if the label was new.
    pub fn add_label(&mut self, id: &str, name: &str) -> bool {
        let id = id.trim();
        if id.is_empty() || self.labels.contains_key(id) {
            return false;
        }
        self.labels.insert(
            id.to_string(),
            LabelEntry {
                id: id.to_string(),
                name: name.trim().to_string(),
                exemplars: IndexSet::new(),
            },
        );
        true
    }

    /// Add `text` as an exemplar of `label`, creating the label if needed.
    ///
    /// Both are trimmed. Returns `true` if the corpus changed; duplicates
    /// and empty strings are absorbed.
    pub fn add_exemplar(&mut self, label: &str, text: &str) -> bool {
        let label = label.trim();
        let text = text.trim();
        if label.is_empty() || text.is_empty() {
            return false;
        }
        let created = self.add_label(label, label);
        let inserted = self
            .labels
            .get_mut(label)
            .map(|entry| entry.exemplars.insert(text.to_string()))
            .unwrap_or(false);
        created || inserted
    }

    pub fn contains_label(&self, id: &str) -> bool {
        self.labels.contains_key(id)
    }

    pub fn contains_exemplar(&self, label: &str, text: &str) -> bool {
        self.labels
            .get(label)
            .map(|entry| entry.exemplars.contains(text.trim()))
            .unwrap_or(false)
    }

    pub fn label(&self, id: &str) -> Option<&LabelEntry> {
        self.labels.get(id)
    }

    pub fn labels(&self) -> impl Iterator<Item = &LabelEntry> {
        self.labels.values()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn exemplar_count(&self) -> usize {
        self.labels.values().map(|l| l.exemplars.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ============ Seed file ============

/// On-disk seed format: `{"labels":[{"id","name","exemplars":[..]}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusSeed {
    #[serde(default)]
    pub labels: Vec<SeedLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedLabel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exemplars: Vec<String>,
}

impl CorpusSeed {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse corpus seed")
    }
}

// ============ Snapshots ============

/// One exemplar with its whitespace-stripped form.
#[derive(Debug, Clone)]
pub struct IndexedExemplar {
    pub label: String,
    pub text: String,
    pub stripped: String,
}

/// Lookup tables for the exact-match stages. Where two labels share an
/// exemplar key, the first in corpus order wins.
#[derive(Debug, Clone, Default)]
pub struct ExemplarIndex {
    exact: HashMap<String, usize>,
    trimmed: HashMap<String, usize>,
    stripped: HashMap<String, usize>,
    entries: Vec<IndexedExemplar>,
}

/// Remove every whitespace character.
pub fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

impl ExemplarIndex {
    pub fn build(corpus: &TrainingCorpus) -> Self {
        let mut index = Self::default();
        for label in corpus.labels() {
            for text in &label.exemplars {
                let i = index.entries.len();
                let stripped = strip_whitespace(text);
                index.exact.entry(text.clone()).or_insert(i);
                index.trimmed.entry(text.trim().to_string()).or_insert(i);
                index.stripped.entry(stripped.clone()).or_insert(i);
                index.entries.push(IndexedExemplar {
                    label: label.id.clone(),
                    text: text.clone(),
                    stripped,
                });
            }
        }
        index
    }

    pub fn exact(&self, text: &str) -> Option<&IndexedExemplar> {
        self.exact.get(text).map(|&i| &self.entries[i])
    }

    pub fn trimmed(&self, text: &str) -> Option<&IndexedExemplar> {
        self.trimmed.get(text.trim()).map(|&i| &self.entries[i])
    }

    pub fn whitespace_insensitive(&self, text: &str) -> Option<&IndexedExemplar> {
        let key = strip_whitespace(text);
        if key.is_empty() {
            return None;
        }
        self.stripped.get(&key).map(|&i| &self.entries[i])
    }

    /// All exemplars in corpus order.
    pub fn entries(&self) -> &[IndexedExemplar] {
        &self.entries
    }
}

/// Summary row of the label catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
    pub exemplar_count: usize,
}

/// An immutable, versioned view of the corpus.
#[derive(Debug)]
pub struct CorpusSnapshot {
    pub version: u64,
    corpus: TrainingCorpus,
    index: ExemplarIndex,
}

impl CorpusSnapshot {
    pub fn new(version: u64, corpus: TrainingCorpus) -> Self {
        let index = ExemplarIndex::build(&corpus);
        Self {
            version,
            corpus,
            index,
        }
    }

    pub fn corpus(&self) -> &TrainingCorpus {
        &self.corpus
    }

    pub fn index(&self) -> &ExemplarIndex {
        &self.index
    }

    pub fn catalog(&self) -> Vec<LabelInfo> {
        self.corpus
            .labels()
            .map(|l| LabelInfo {
                id: l.id.clone(),
                name: l.name.clone(),
                exemplar_count: l.exemplars.len(),
            })
            .collect()
    }
}

/// Shared pointer to the current [`CorpusSnapshot`].
#[derive(Debug)]
pub struct CorpusHandle {
    current: RwLock<Arc<CorpusSnapshot>>,
}

impl CorpusHandle {
    /// Start at version 1.
    pub fn new(corpus: TrainingCorpus) -> Self {
        Self {
            current: RwLock::new(Arc::new(CorpusSnapshot::new(1, corpus))),
        }
    }

    pub fn load(&self) -> Arc<CorpusSnapshot> {
        self.current.read().unwrap().clone()
    }

    pub fn version(&self) -> u64 {
        self.load().version
    }

    /// Replace the snapshot with one built from `corpus`; returns the new
    /// version.
    pub fn publish(&self, corpus: TrainingCorpus) -> u64 {
        let mut current = self.current.write().unwrap();
        Self::install(&mut current, corpus)
    }

    /// Apply `mutate` to a copy of the current corpus and publish the copy
    /// if `mutate` reports a change. Load, mutate and publish happen under
    /// one write lock, so a concurrent [`publish`](Self::publish) is never
    /// overwritten. Returns the new version, or `None` if nothing changed.
    pub fn update<F>(&self, mutate: F) -> Option<u64>
    where
        F: FnOnce(&mut TrainingCorpus) -> bool,
    {
        let mut current = self.current.write().unwrap();
        let mut next = current.corpus().clone();
        if !mutate(&mut next) {
            return None;
        }
        Some(Self::install(&mut current, next))
    }

    fn install(current: &mut Arc<CorpusSnapshot>, corpus: TrainingCorpus) -> u64 {
        let version = current.version + 1;
        *current = Arc::new(CorpusSnapshot::new(version, corpus));
        tracing::info!(
            version,
            labels = current.corpus().label_count(),
            exemplars = current.corpus().exemplar_count(),
            "published corpus snapshot"
        );
        version
    }
}

impl Default for CorpusHandle {
    fn default() -> Self {
        Self::new(TrainingCorpus::new())
    }
}

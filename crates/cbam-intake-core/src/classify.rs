//! Material classification: free text → controlled label.
//!
//! # Cascade
//!
//! Each text is resolved by the first stage that produces a hit:
//!
//! | Stage | Test | Confidence | `match_kind` |
//! |-------|------|------------|--------------|
//! | 0 | text is blank | 0 | `none` (label `""`) |
//! | 0 | corpus has no labels | 100 | `none`, note `"no training data"` |
//! | 1 | text equals a label id | 100 | `exact_label` |
//! | 2a | text equals an exemplar | 100 | `exact_exemplar` |
//! | 2b | trimmed text equals an exemplar | 100 | `exact_exemplar` |
//! | 2c | equal once all whitespace is removed | 100 | `exact_exemplar_whitespace_insensitive` |
//! | 2d | stem-hint prefix match | 95 | `prefix_heuristic` |
//! | 3 | cosine similarity ≥ threshold | `sim × 100`, below 100 | `similarity` |
//! | fallback | nothing cleared the threshold | 0 | `none` (text echoed) |
//!
//! Stages 1–2 are hash lookups against the snapshot's [`ExemplarIndex`];
//! they never call the embedder. Each pass of stage 2 runs across the whole
//! corpus before the next, looser pass is tried.
//!
//! ## Stem hint
//!
//! When a stem character is configured and both the text and an exemplar
//! start with it, the pair matches if one whitespace-stripped string is a
//! prefix of the other (the shorter one must have at least two
//! characters). Plain whitespace-stripped equality is already answered by
//! pass 2c at confidence 100, so the prefix relation is what this stage
//! adds: truncated or extended spellings of stemmed material names, such
//! as `휘발유` against `휘발유 (무연)`. It is a deliberate extension with
//! no wider generalisation; texts not starting with the stem never reach
//! it, and with no stem configured the stage is off.
//!
//! ## Similarity
//!
//! Texts that fall through to stage 3 are embedded in mini-batches of
//! `batch_size`, with at most `concurrency` mini-batches in flight.
//! Exemplar vectors are embedded once per snapshot version and memoized.
//! Scores are aggregated per label by maximum over its exemplars; labels
//! below the threshold are dropped and the top-k survivors are reported,
//! ties kept in corpus order. Scores are compared with the threshold in
//! `f32`, the precision they are computed in, so a score equal to the
//! threshold is kept and reported at exactly `threshold × 100`. Any embedding failure degrades the affected
//! texts to "no match" with the note `"embedding unavailable"`.
//!
//! # Snapshots
//!
//! [`Classifier::classify_batch`] loads the corpus snapshot once at entry, so
//! a concurrent [`Classifier::swap_corpus`] is either fully visible to a
//! batch or not at all.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;

use crate::corpus::{strip_whitespace, CorpusHandle, CorpusSnapshot, LabelInfo, TrainingCorpus};
use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{ClassificationResult, LabelScore, MatchKind};

/// Highest confidence a similarity result may carry.
const MAX_SIMILARITY_CONFIDENCE: f64 = 99.99;

/// Tuning for [`Classifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierParams {
    /// Minimum cosine similarity in `[0, 1]` for a stage-3 hit.
    pub similarity_threshold: f64,
    /// Number of similarity candidates reported.
    pub top_k: usize,
    /// Texts per embedding call.
    pub batch_size: usize,
    pub stem_hint: Option<char>,
    /// Embedding calls in flight at once.
    pub concurrency: usize,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.70,
            top_k: 3,
            batch_size: 16,
            stem_hint: None,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Anything that can classify a batch of texts.
///
/// The orchestrator depends on this trait rather than on [`Classifier`] so
/// tests can substitute a stub.
#[async_trait]
pub trait BatchClassifier: Send + Sync {
    /// Classify `texts`, returning one result per input in input order.
    async fn classify_batch(&self, texts: &[String]) -> Vec<ClassificationResult>;

    /// Version of the corpus snapshot currently served.
    fn corpus_version(&self) -> u64;
}

/// The hybrid exact / heuristic / similarity classifier.
pub struct Classifier {
    corpus: Arc<CorpusHandle>,
    embedder: Arc<dyn Embedder>,
    params: ClassifierParams,
    exemplar_vectors: Mutex<Option<(u64, Arc<Vec<Vec<f32>>>)>>,
}

impl Classifier {
    pub fn new(
        corpus: Arc<CorpusHandle>,
        embedder: Arc<dyn Embedder>,
        params: ClassifierParams,
    ) -> Self {
        Self {
            corpus,
            embedder,
            params,
            exemplar_vectors: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    pub fn corpus(&self) -> &Arc<CorpusHandle> {
        &self.corpus
    }

    /// Classify a single text.
    pub async fn classify(&self, text: &str) -> ClassificationResult {
        self.classify_batch(&[text.to_string()])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| ClassificationResult::no_match(text))
    }

    /// Atomically replace the corpus; returns the new snapshot version.
    ///
    /// Later feedback is applied on top of the swapped corpus.
    pub fn swap_corpus(&self, corpus: TrainingCorpus) -> u64 {
        self.corpus.publish(corpus)
    }

    /// Labels of the current snapshot with its version.
    pub fn label_catalog(&self) -> (u64, Vec<LabelInfo>) {
        let snapshot = self.corpus.load();
        (snapshot.version, snapshot.catalog())
    }

    /// Stages 0–2. `None` means the text needs the similarity stage.
    fn resolve_exact(&self, snapshot: &CorpusSnapshot, text: &str) -> Option<ClassificationResult> {
        if text.trim().is_empty() {
            return Some(ClassificationResult::empty());
        }
        if snapshot.corpus().is_empty() {
            return Some(ClassificationResult::no_training_data(text));
        }
        if snapshot.corpus().contains_label(text) {
            return Some(ClassificationResult::exact_label(text));
        }

        let index = snapshot.index();
        if let Some(hit) = index.exact(text).or_else(|| index.trimmed(text)) {
            return Some(ClassificationResult::exact_exemplar(
                &hit.label,
                &hit.text,
                MatchKind::ExactExemplar,
            ));
        }
        if let Some(hit) = index.whitespace_insensitive(text) {
            return Some(ClassificationResult::exact_exemplar(
                &hit.label,
                &hit.text,
                MatchKind::ExactExemplarWhitespaceInsensitive,
            ));
        }

        let stem = self.params.stem_hint?;
        let trimmed = text.trim();
        if !trimmed.starts_with(stem) {
            return None;
        }
        let stripped = strip_whitespace(trimmed);
        index
            .entries()
            .iter()
            .filter(|e| e.text.starts_with(stem))
            .find(|e| {
                let (short, long) = if stripped.len() <= e.stripped.len() {
                    (&stripped, &e.stripped)
                } else {
                    (&e.stripped, &stripped)
                };
                short.chars().count() >= 2 && long.starts_with(short.as_str())
            })
            .map(|e| ClassificationResult::prefix_heuristic(&e.label, &e.text))
    }

    /// Embed `texts` in mini-batches. A failed mini-batch yields `None` for
    /// each of its texts.
    async fn embed_batched(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let size = self.params.batch_size.max(1);
        let chunks: Vec<Vec<String>> = texts.chunks(size).map(<[String]>::to_vec).collect();
        let results: Vec<Result<Vec<Vec<f32>>>> = stream::iter(chunks)
            .map(|chunk| embed_chunk(self.embedder.clone(), chunk))
            .buffered(self.params.concurrency.max(1))
            .collect()
            .await;

        let mut out = Vec::with_capacity(texts.len());
        for (chunk, result) in texts.chunks(size).zip(results) {
            match result {
                Ok(vectors) => out.extend(vectors.into_iter().map(Some)),
                Err(e) => {
                    tracing::warn!(
                        model = self.embedder.model_name(),
                        count = chunk.len(),
                        error = %e,
                        "embedding mini-batch failed"
                    );
                    out.extend(std::iter::repeat_with(|| None).take(chunk.len()));
                }
            }
        }
        out
    }

    /// Vectors for every exemplar of `snapshot`, in index order.
    async fn exemplar_vectors(&self, snapshot: &CorpusSnapshot) -> Option<Arc<Vec<Vec<f32>>>> {
        let cached = self
            .exemplar_vectors
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(version, _)| *version == snapshot.version)
            .map(|(_, vectors)| vectors.clone());
        if cached.is_some() {
            return cached;
        }

        let texts: Vec<String> = snapshot
            .index()
            .entries()
            .iter()
            .map(|e| e.text.clone())
            .collect();
        let vectors: Vec<Vec<f32>> = self
            .embed_batched(&texts)
            .await
            .into_iter()
            .collect::<Option<_>>()?;
        let vectors = Arc::new(vectors);

        *self.exemplar_vectors.lock().unwrap() = Some((snapshot.version, vectors.clone()));
        Some(vectors)
    }

    /// Stage 3 for one query vector.
    fn rank(
        &self,
        snapshot: &CorpusSnapshot,
        query: &[f32],
        exemplar_vectors: &[Vec<f32>],
    ) -> Vec<LabelScore> {
        let threshold = self.params.similarity_threshold as f32;
        let floor = self.params.similarity_threshold * 100.0;

        let mut best: IndexMap<&str, (f32, &str)> = IndexMap::new();
        for (entry, vector) in snapshot.index().entries().iter().zip(exemplar_vectors) {
            let sim = cosine_similarity(query, vector);
            let slot = best.entry(entry.label.as_str()).or_insert((sim, entry.text.as_str()));
            if sim > slot.0 {
                *slot = (sim, entry.text.as_str());
            }
        }

        let mut ranked: Vec<(&str, f32, &str)> = best
            .into_iter()
            .filter(|(_, (sim, _))| *sim >= threshold)
            .map(|(label, (sim, text))| (label, sim, text))
            .collect();
        // Stable: equal scores keep corpus order.
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.params.top_k.max(1));

        ranked
            .into_iter()
            .map(|(label, sim, text)| LabelScore {
                label: label.to_string(),
                confidence: (f64::from(sim) * 100.0)
                    .max(floor)
                    .min(MAX_SIMILARITY_CONFIDENCE),
                best_match: text.to_string(),
            })
            .collect()
    }
}

async fn embed_chunk(embedder: Arc<dyn Embedder>, chunk: Vec<String>) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder.embed(&chunk).await?;
    anyhow::ensure!(
        vectors.len() == chunk.len(),
        "embedder returned {} vectors for {} texts",
        vectors.len(),
        chunk.len()
    );
    Ok(vectors)
}

#[async_trait]
impl BatchClassifier for Classifier {
    async fn classify_batch(&self, texts: &[String]) -> Vec<ClassificationResult> {
        let snapshot = self.corpus.load();

        let mut results: Vec<Option<ClassificationResult>> = texts
            .iter()
            .map(|t| self.resolve_exact(&snapshot, t))
            .collect();

        let pending: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect();

        if !pending.is_empty() {
            tracing::debug!(
                total = texts.len(),
                similarity = pending.len(),
                version = snapshot.version,
                "classifying by similarity"
            );
            let queries: Vec<String> = pending.iter().map(|&i| texts[i].trim().to_string()).collect();

            match self.exemplar_vectors(&snapshot).await {
                Some(exemplars) => {
                    let vectors = self.embed_batched(&queries).await;
                    for (&i, vector) in pending.iter().zip(vectors) {
                        let result = match vector {
                            Some(v) => ClassificationResult::similarity(self.rank(&snapshot, &v, &exemplars))
                                .unwrap_or_else(|| ClassificationResult::no_match(&texts[i])),
                            None => ClassificationResult::no_match(&texts[i])
                                .with_note("embedding unavailable"),
                        };
                        results[i] = Some(result);
                    }
                }
                None => {
                    for &i in &pending {
                        results[i] = Some(
                            ClassificationResult::no_match(&texts[i]).with_note("embedding unavailable"),
                        );
                    }
                }
            }
        }

        results
            .into_iter()
            .zip(texts)
            .map(|(r, t)| r.unwrap_or_else(|| ClassificationResult::no_match(t)))
            .collect()
    }

    fn corpus_version(&self) -> u64 {
        self.corpus.version()
    }
}

//! Configuration loading.
//!
//! Settings come from a TOML file (default `./config/intake.toml`). Every
//! section and key is optional; a missing file means all defaults. After
//! parsing, a closed set of environment variables overrides the file:
//!
//! | Variable | Key |
//! |----------|-----|
//! | `DEFAULT_UNIT` | `normalize.default_unit` |
//! | `SIMILARITY_THRESHOLD` | `classifier.similarity_threshold` |
//! | `TOP_K` | `classifier.top_k` |
//! | `BATCH_SIZE` | `classifier.batch_size` |
//! | `STEM_HINT_CHAR` | `classifier.stem_hint` |
//! | `BATCH_DEADLINE_SECONDS` | `pipeline.batch_deadline_secs` |
//! | `EMBEDDING_CACHE_CAPACITY` | `embedding.cache_capacity` |
//!
//! ```toml
//! [db]
//! path = "./data/intake.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [corpus]
//! seed_path = "./config/labels.json"
//! feedback_log = "./data/feedback.jsonl"
//!
//! [classifier]
//! similarity_threshold = 0.70
//! top_k = 3
//!
//! [embedding]
//! provider = "ngram"
//! dims = 256
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cbam_intake_core::classify::ClassifierParams;
use cbam_intake_core::normalize::NormalizeParams;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/intake.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// JSON seed with the label vocabulary. Optional.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
    #[serde(default = "default_feedback_log")]
    pub feedback_log: PathBuf,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            seed_path: None,
            feedback_log: default_feedback_log(),
        }
    }
}

fn default_feedback_log() -> PathBuf {
    PathBuf::from("./data/feedback.jsonl")
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_unit")]
    pub default_unit: String,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            default_unit: default_unit(),
        }
    }
}

fn default_unit() -> String {
    "t".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Single stem character, or empty for none.
    #[serde(default)]
    pub stem_hint: String,
    /// Embedding calls in flight; defaults to available parallelism.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_threshold(),
            top_k: default_top_k(),
            batch_size: default_batch_size(),
            stem_hint: String::new(),
            concurrency: None,
        }
    }
}

fn default_threshold() -> f64 {
    0.70
}
fn default_top_k() -> usize {
    3
}
fn default_batch_size() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_deadline_secs")]
    pub batch_deadline_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_provider() -> String {
    "ngram".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> u64 {
    10_000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// All defaults; used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Override settings from the closed environment set. `lookup` returns
    /// the raw value of a variable, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEFAULT_UNIT") {
            self.normalize.default_unit = v;
        }
        if let Some(v) = lookup("SIMILARITY_THRESHOLD") {
            self.classifier.similarity_threshold = parse_env("SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("TOP_K") {
            self.classifier.top_k = parse_env("TOP_K", &v)?;
        }
        if let Some(v) = lookup("BATCH_SIZE") {
            self.classifier.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("BATCH_DEADLINE_SECONDS") {
            self.pipeline.batch_deadline_secs = parse_env("BATCH_DEADLINE_SECONDS", &v)?;
        }
        if let Some(v) = lookup("STEM_HINT_CHAR") {
            self.classifier.stem_hint = v;
        }
        if let Some(v) = lookup("EMBEDDING_CACHE_CAPACITY") {
            self.embedding.cache_capacity = parse_env("EMBEDDING_CACHE_CAPACITY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.normalize.default_unit.trim().is_empty() {
            anyhow::bail!("normalize.default_unit must not be empty");
        }

        let c = &self.classifier;
        if !(0.0..=1.0).contains(&c.similarity_threshold) {
            anyhow::bail!("classifier.similarity_threshold must be in [0.0, 1.0]");
        }
        if c.top_k < 1 {
            anyhow::bail!("classifier.top_k must be >= 1");
        }
        if c.batch_size < 1 {
            anyhow::bail!("classifier.batch_size must be >= 1");
        }
        if c.concurrency == Some(0) {
            anyhow::bail!("classifier.concurrency must be >= 1");
        }
        if c.stem_hint.chars().count() > 1 {
            anyhow::bail!(
                "classifier.stem_hint must be a single character or empty, got '{}'",
                c.stem_hint
            );
        }

        if self.pipeline.batch_deadline_secs == 0 {
            anyhow::bail!("pipeline.batch_deadline_secs must be > 0");
        }

        let e = &self.embedding;
        if e.cache_capacity < 1 {
            anyhow::bail!("embedding.cache_capacity must be >= 1");
        }
        match e.provider.as_str() {
            "disabled" | "ngram" => {}
            "openai" | "ollama" => {
                if e.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        e.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, ngram, openai, or ollama.",
                other
            ),
        }
        if e.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0");
        }

        Ok(())
    }

    pub fn normalize_params(&self) -> NormalizeParams {
        NormalizeParams {
            default_unit: self.normalize.default_unit.trim().to_string(),
        }
    }

    pub fn classifier_params(&self) -> ClassifierParams {
        let defaults = ClassifierParams::default();
        ClassifierParams {
            similarity_threshold: self.classifier.similarity_threshold,
            top_k: self.classifier.top_k,
            batch_size: self.classifier.batch_size,
            stem_hint: self.classifier.stem_hint.chars().next(),
            concurrency: self.classifier.concurrency.unwrap_or(defaults.concurrency),
        }
    }

    pub fn batch_deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline.batch_deadline_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value for {}: '{}' ({})", key, value, e))
}

/// Parse a config file without environment overrides or validation.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

/// Load, override from the environment, and validate.
///
/// A missing file is not an error: defaults are used.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        Config::minimal()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

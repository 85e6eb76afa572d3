//! Configuration types for a pipeline run.
//!
//! All run behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it easy
//! to log a run's settings and diff two runs to see why their outputs differ.
//!
//! Prompts are operator data, not code: a [`PromptBook`] maps each
//! [`PromptKey`] to a prompt template and an optional model override, and
//! can be loaded from a JSON file.

use crate::error::PipelineError;
use crate::llm::ClientSettings;
use crate::point_id::PointId;
use crate::progress::ProgressCallback;
use crate::stages::StageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Model used when a prompt entry names none.
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`].
///
/// # Example
/// ```rust
/// use content_pipeline::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .pdf_path("chapter3.pdf")
///     .output_dir("out")
///     .start_point_id("1050030001")
///     .chapter_name("Cells")
///     .build()
///     .unwrap();
/// assert_eq!(config.book_chapter(), "105003");
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Source PDF (the current edition's chapter).
    pub pdf_path: PathBuf,

    /// Directory every artifact is written to. Default: `output`.
    pub output_dir: PathBuf,

    /// Human chapter name; substituted into prompts and used in the Stage V
    /// and Stage Z file names.
    pub chapter_name: String,

    /// First PointId of the chapter. Book and chapter ids for every file name
    /// come from it; Stage 4 allocates from its sequence number.
    pub start_point_id: PointId,

    /// Word document with the chapter's teaching notes (Stages J, V).
    pub word_file: Option<PathBuf>,

    /// Previous edition of the chapter (Stages X, Y).
    pub old_book_pdf: Option<PathBuf>,

    /// Stages to run, in order. Default: `1,2,3,4,E,F,J,V`.
    pub stages: Vec<StageId>,

    /// Skip every stage before this one; earlier artifacts must be on disk.
    pub resume_from: Option<StageId>,

    /// Prompt templates and per-stage model overrides.
    pub prompts: PromptBook,

    /// Model used when a prompt entry names none. Default: [`DEFAULT_MODEL`].
    pub default_model: String,

    /// Sampling temperature. Default: 0.7.
    pub temperature: f32,

    /// Requested output tokens per call, clamped per model. Default: 32768.
    pub max_tokens: u32,

    /// Pause between successive units of one stage. Default: 5 s.
    ///
    /// Provider rate limiters count requests per minute; spacing topic and
    /// part calls keeps a long stage under that budget.
    pub pacing_delay: Duration,

    /// Safety valve for continuation loops. Default: 50 chunks.
    pub max_chunks: usize,

    /// Records per Stage J call. Default: 200.
    pub importance_batch_size: usize,

    /// Records per Stage H call. Default: 120.
    pub flashcard_batch_size: usize,

    /// Records per Stage X call. Default: 200.
    pub changes_batch_size: usize,

    /// Drop rows that overlapping page halves transcribed twice, beyond
    /// exact duplicates. Default: true.
    pub drop_overlapping_rows: bool,

    /// Attempts for single-call stages whose reply must contain JSON. Default: 3.
    pub single_call_attempts: u32,

    /// Retry, rotation and circuit-breaker tuning.
    pub client: ClientSettings,

    /// Per-request HTTP timeout in seconds. Default: 600.
    pub api_timeout_secs: u64,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pdf_path: PathBuf::new(),
            output_dir: PathBuf::from("output"),
            chapter_name: String::new(),
            start_point_id: PointId::new(0, 0, 1),
            word_file: None,
            old_book_pdf: None,
            stages: StageId::DEFAULT_CHAIN.to_vec(),
            resume_from: None,
            prompts: PromptBook::default(),
            default_model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 32_768,
            pacing_delay: Duration::from_secs(5),
            max_chunks: 50,
            importance_batch_size: 200,
            flashcard_batch_size: 120,
            changes_batch_size: 200,
            drop_overlapping_rows: true,
            single_call_attempts: 3,
            client: ClientSettings::default(),
            api_timeout_secs: 600,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("pdf_path", &self.pdf_path)
            .field("output_dir", &self.output_dir)
            .field("chapter_name", &self.chapter_name)
            .field("start_point_id", &self.start_point_id.to_string())
            .field("word_file", &self.word_file)
            .field("old_book_pdf", &self.old_book_pdf)
            .field("stages", &self.stages)
            .field("resume_from", &self.resume_from)
            .field("prompts", &self.prompts.keys())
            .field("default_model", &self.default_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("pacing_delay", &self.pacing_delay)
            .field("max_chunks", &self.max_chunks)
            .field("drop_overlapping_rows", &self.drop_overlapping_rows)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
            start_point_id: None,
        }
    }

    /// The `BBBCCC` prefix of every chapter-scoped file name.
    pub fn book_chapter(&self) -> String {
        self.start_point_id.book_chapter()
    }

    /// Prompt and resolved model for `key`.
    pub fn prompt(&self, key: PromptKey) -> Option<(&str, &str)> {
        self.prompts.get(key).map(|p| {
            (
                p.prompt.as_str(),
                p.model.as_deref().unwrap_or(&self.default_model),
            )
        })
    }

    /// Like [`prompt`](Self::prompt) but a missing entry is a stage failure.
    pub fn require_prompt(&self, key: PromptKey, stage: StageId) -> Result<(&str, &str), PipelineError> {
        self.prompt(key)
            .filter(|(p, _)| !p.trim().is_empty())
            .ok_or_else(|| PipelineError::missing(stage, format!("no prompt configured for {key:?}")))
    }

    /// The stage list after applying `resume_from`.
    pub fn effective_stages(&self) -> Vec<StageId> {
        match self.resume_from {
            Some(from) => self
                .stages
                .iter()
                .copied()
                .skip_while(|s| *s != from)
                .collect(),
            None => self.stages.clone(),
        }
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    start_point_id: Option<String>,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .field("start_point_id", &self.start_point_id)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn pdf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdf_path = path.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn chapter_name(mut self, name: impl Into<String>) -> Self {
        self.config.chapter_name = name.into();
        self
    }

    /// Ten-digit `BBBCCCPPPP`; validated in [`build`](Self::build).
    pub fn start_point_id(mut self, id: impl Into<String>) -> Self {
        self.start_point_id = Some(id.into());
        self
    }

    pub fn word_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.word_file = Some(path.into());
        self
    }

    pub fn old_book_pdf(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.old_book_pdf = Some(path.into());
        self
    }

    pub fn stages(mut self, stages: Vec<StageId>) -> Self {
        self.config.stages = stages;
        self
    }

    pub fn resume_from(mut self, stage: StageId) -> Self {
        self.config.resume_from = Some(stage);
        self
    }

    pub fn prompts(mut self, prompts: PromptBook) -> Self {
        self.config.prompts = prompts;
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.config.default_model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn pacing_delay(mut self, delay: Duration) -> Self {
        self.config.pacing_delay = delay;
        self
    }

    pub fn max_chunks(mut self, n: usize) -> Self {
        self.config.max_chunks = n.max(1);
        self
    }

    pub fn importance_batch_size(mut self, n: usize) -> Self {
        self.config.importance_batch_size = n.max(1);
        self
    }

    pub fn flashcard_batch_size(mut self, n: usize) -> Self {
        self.config.flashcard_batch_size = n.max(1);
        self
    }

    pub fn changes_batch_size(mut self, n: usize) -> Self {
        self.config.changes_batch_size = n.max(1);
        self
    }

    pub fn drop_overlapping_rows(mut self, enabled: bool) -> Self {
        self.config.drop_overlapping_rows = enabled;
        self
    }

    pub fn single_call_attempts(mut self, n: u32) -> Self {
        self.config.single_call_attempts = n.max(1);
        self
    }

    pub fn client_settings(mut self, settings: ClientSettings) -> Self {
        self.config.client = settings;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<PipelineConfig, PipelineError> {
        if let Some(raw) = self.start_point_id.take() {
            self.config.start_point_id = raw.trim().parse()?;
        }
        let c = &self.config;
        if c.pdf_path.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig("a source PDF path is required".into()));
        }
        if c.stages.is_empty() {
            return Err(PipelineError::InvalidConfig("at least one stage is required".into()));
        }
        if let Some(from) = c.resume_from {
            if !c.stages.contains(&from) {
                return Err(PipelineError::InvalidConfig(format!(
                    "resume stage {from} is not in the stage list"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Prompts ──────────────────────────────────────────────────────────────

/// Every prompt slot an operator can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKey {
    Stage1,
    Stage2,
    Stage3,
    Stage4,
    StageE,
    StageJ,
    StageH,
    StageL,
    StageVStep1,
    StageVStep2,
    StageVStep3,
    StageXExtraction,
    StageXChanges,
    StageY,
    StageZ,
}

/// One prompt template plus an optional model override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The operator's prompt templates, keyed by slot.
///
/// Serialises as a flat JSON object:
/// `{"stage1": {"prompt": "...", "model": "gemini-2.5-pro"}, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptBook {
    entries: BTreeMap<PromptKey, PromptEntry>,
}

impl PromptBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: PromptKey, prompt: impl Into<String>, model: Option<&str>) -> Self {
        self.set(key, prompt, model);
        self
    }

    pub fn set(&mut self, key: PromptKey, prompt: impl Into<String>, model: Option<&str>) {
        self.entries.insert(
            key,
            PromptEntry {
                prompt: prompt.into(),
                model: model.map(str::to_string),
            },
        );
    }

    pub fn get(&self, key: PromptKey) -> Option<&PromptEntry> {
        self.entries.get(&key)
    }

    pub fn keys(&self) -> Vec<PromptKey> {
        self.entries.keys().copied().collect()
    }

    /// Load a prompt book from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| PipelineError::FileNotFound {
                path: path.to_path_buf(),
            })?;
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::InvalidConfig(format!("prompt file {}: {e}", path.display()))
        })
    }
}

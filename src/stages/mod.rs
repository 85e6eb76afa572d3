//! The stage processors and what they share.
//!
//! Every stage follows the same cycle: load its upstream artifacts, build a
//! prompt, invoke the model (once, per part, or per topic), extract JSON,
//! merge, persist. A stage only sees its inputs through [`StageInputs`],
//! which the orchestrator resolves from this run's results or, on resume,
//! from the predictable file names in the output directory.

pub mod changes;
pub mod deletions;
pub mod flashcards;
pub mod image_catalog;
pub mod image_notes;
pub mod importance;
pub mod join;
pub mod ocr;
pub mod overview;
pub mod parts;
pub mod richtext;
pub mod structure;
pub mod test_bank;
pub mod topics;

use crate::artifact::{self, field_str, normalize_record, records_in, Record, StageArtifact};
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::document::word;
use crate::error::{PipelineError, UnitError};
use crate::json_repair;
use crate::progress::StagePhase;
use crate::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

// ── Stage identity ───────────────────────────────────────────────────────

/// Every stage the pipeline knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageId {
    #[serde(rename = "1")]
    S1,
    #[serde(rename = "2")]
    S2,
    #[serde(rename = "3")]
    S3,
    #[serde(rename = "4")]
    S4,
    E,
    F,
    J,
    H,
    M,
    L,
    V,
    X,
    Y,
    Z,
}

/// An upstream stage and whether its output is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub stage: StageId,
    pub required: bool,
}

const fn req(stage: StageId) -> Dependency {
    Dependency {
        stage,
        required: true,
    }
}

const fn opt(stage: StageId) -> Dependency {
    Dependency {
        stage,
        required: false,
    }
}

impl StageId {
    /// `1,2,3,4,E,F,J,V`
    pub const DEFAULT_CHAIN: [StageId; 8] = [
        StageId::S1,
        StageId::S2,
        StageId::S3,
        StageId::S4,
        StageId::E,
        StageId::F,
        StageId::J,
        StageId::V,
    ];

    /// `X,Y,Z`, run after the default chain.
    pub const EXTENSION_CHAIN: [StageId; 3] = [StageId::X, StageId::Y, StageId::Z];

    pub const ALL: [StageId; 14] = [
        StageId::S1,
        StageId::S2,
        StageId::S3,
        StageId::S4,
        StageId::E,
        StageId::F,
        StageId::J,
        StageId::H,
        StageId::M,
        StageId::L,
        StageId::V,
        StageId::X,
        StageId::Y,
        StageId::Z,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StageId::S1 => "1",
            StageId::S2 => "2",
            StageId::S3 => "3",
            StageId::S4 => "4",
            StageId::E => "E",
            StageId::F => "F",
            StageId::J => "J",
            StageId::H => "H",
            StageId::M => "M",
            StageId::L => "L",
            StageId::V => "V",
            StageId::X => "X",
            StageId::Y => "Y",
            StageId::Z => "Z",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StageId::S1 => "OCR extraction",
            StageId::S2 => "per-part post-processing",
            StageId::S3 => "structure extraction",
            StageId::S4 => "hierarchy to points",
            StageId::E => "image notes",
            StageId::F => "image catalog",
            StageId::J => "importance and type",
            StageId::H => "flashcards",
            StageId::M => "topic index",
            StageId::L => "chapter overview",
            StageId::V => "test bank",
            StageId::X => "edition changes",
            StageId::Y => "edition deletions",
            StageId::Z => "rich-text report",
        }
    }

    /// Upstream stages, in the order the stage reads them.
    pub fn dependencies(self) -> &'static [Dependency] {
        use StageId::*;
        const S2_DEPS: [Dependency; 1] = [req(S1)];
        const S3_DEPS: [Dependency; 1] = [req(S2)];
        const S4_DEPS: [Dependency; 1] = [req(S3)];
        const E_DEPS: [Dependency; 2] = [req(S1), req(S4)];
        const F_DEPS: [Dependency; 1] = [req(E)];
        const J_DEPS: [Dependency; 2] = [req(E), opt(F)];
        const H_DEPS: [Dependency; 2] = [req(J), opt(F)];
        const M_DEPS: [Dependency; 1] = [req(H)];
        const L_DEPS: [Dependency; 2] = [req(J), req(V)];
        const V_DEPS: [Dependency; 1] = [req(J)];
        const X_DEPS: [Dependency; 1] = [req(J)];
        const Y_DEPS: [Dependency; 2] = [req(S1), opt(X)];
        const Z_DEPS: [Dependency; 3] = [req(J), req(X), req(Y)];
        match self {
            S1 => &[],
            S2 => &S2_DEPS,
            S3 => &S3_DEPS,
            S4 => &S4_DEPS,
            E => &E_DEPS,
            F => &F_DEPS,
            J => &J_DEPS,
            H => &H_DEPS,
            M => &M_DEPS,
            L => &L_DEPS,
            V => &V_DEPS,
            X => &X_DEPS,
            Y => &Y_DEPS,
            Z => &Z_DEPS,
        }
    }

    /// The predictable file name of this stage's primary artifact.
    pub fn output_file_name(self, book_chapter: &str, chapter_name: &str) -> String {
        let named = |prefix: &str, ext: &str| {
            let clean = clean_chapter_name(chapter_name);
            if clean.is_empty() {
                format!("{prefix}{book_chapter}.{ext}")
            } else {
                format!("{prefix}{book_chapter}+{clean}.{ext}")
            }
        };
        match self {
            StageId::S1 => format!("s1_{book_chapter}.json"),
            StageId::S2 => format!("s2_{book_chapter}.json"),
            StageId::S3 => format!("s3_{book_chapter}.json"),
            StageId::S4 => format!("s4_{book_chapter}.json"),
            StageId::E => format!("e{book_chapter}.json"),
            StageId::F => "f.json".to_string(),
            StageId::J => format!("a{book_chapter}.json"),
            StageId::H => format!("ac{book_chapter}.json"),
            StageId::M => format!("i{book_chapter}.json"),
            StageId::L => format!("o{book_chapter}.json"),
            StageId::V => named("b", "json"),
            StageId::X => format!("x{book_chapter}.json"),
            StageId::Y => format!("y{book_chapter}.json"),
            StageId::Z => named("z", "rtf"),
        }
    }

    /// [`output_file_name`](Self::output_file_name) inside the configured output directory.
    pub fn output_path(self, config: &PipelineConfig) -> PathBuf {
        config
            .output_dir
            .join(self.output_file_name(&config.book_chapter(), &config.chapter_name))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StageId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches(|c| c == 's' || c == 'S');
        let wanted = if wanted.is_empty() { s.trim() } else { wanted };
        StageId::ALL
            .iter()
            .copied()
            .find(|id| id.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown stage '{s}'")))
    }
}

/// Parse a comma-separated stage list such as `1,2,3,4,E,F,J,V`.
pub fn parse_stage_list(list: &str) -> Result<Vec<StageId>, PipelineError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

static RE_BAD_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\s]"#).unwrap());
static RE_UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

/// Make a chapter name safe for a file name: reserved characters and
/// whitespace become `_`, runs collapse, edges are trimmed.
pub fn clean_chapter_name(name: &str) -> String {
    let replaced = RE_BAD_FILENAME.replace_all(name.trim(), "_");
    RE_UNDERSCORES
        .replace_all(&replaced, "_")
        .trim_matches('_')
        .to_string()
}

// ── Processor contract ───────────────────────────────────────────────────

/// Paths of the upstream artifacts a stage may read.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    paths: BTreeMap<StageId, PathBuf>,
}

impl StageInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: StageId, path: PathBuf) {
        self.paths.insert(stage, path);
    }

    pub fn get(&self, stage: StageId) -> Option<&Path> {
        self.paths.get(&stage).map(PathBuf::as_path)
    }

    /// The path for a required upstream, or `MissingInput` naming `consumer`.
    pub fn require(&self, consumer: StageId, stage: StageId) -> Result<&Path, PipelineError> {
        self.get(stage).ok_or_else(|| {
            PipelineError::missing(consumer, format!("no Stage {stage} artifact available"))
        })
    }
}

/// What a successful stage produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutcome {
    pub output_path: PathBuf,
    /// Companion files (CSV, catalog, raw hierarchy).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_outputs: Vec<PathBuf>,
    pub records: usize,
    /// Units that failed while the stage still produced usable data.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_units: Vec<UnitError>,
}

impl StageOutcome {
    pub fn new(output_path: PathBuf, records: usize) -> Self {
        Self {
            output_path,
            records,
            ..Self::default()
        }
    }

    pub fn with_extra(mut self, path: PathBuf) -> Self {
        self.extra_outputs.push(path);
        self
    }

    pub fn with_failures(mut self, failures: Vec<UnitError>) -> Self {
        self.failed_units = failures;
        self
    }
}

/// One pipeline stage.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn id(&self) -> StageId;

    /// Why the stage should be skipped, when an optional prerequisite is absent.
    fn skip_reason(&self, ctx: &PipelineContext) -> Option<String> {
        let _ = ctx;
        None
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError>;
}

/// The built-in processor for `id`.
pub fn processor_for(id: StageId) -> Box<dyn StageProcessor> {
    match id {
        StageId::S1 => Box::new(ocr::OcrStage),
        StageId::S2 => Box::new(parts::PartsStage),
        StageId::S3 => Box::new(structure::StructureStage),
        StageId::S4 => Box::new(structure::PointsStage),
        StageId::E => Box::new(image_notes::ImageNotesStage),
        StageId::F => Box::new(image_catalog::ImageCatalogStage),
        StageId::J => Box::new(importance::ImportanceStage),
        StageId::H => Box::new(flashcards::FlashcardStage),
        StageId::M => Box::new(topics::TopicIndexStage),
        StageId::L => Box::new(overview::OverviewStage),
        StageId::V => Box::new(test_bank::TestBankStage),
        StageId::X => Box::new(changes::ChangesStage),
        StageId::Y => Box::new(deletions::DeletionsStage),
        StageId::Z => Box::new(richtext::RichTextStage),
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Load an upstream artifact and normalise its records to the canonical schema.
pub(crate) async fn load_records(path: &Path) -> Result<(StageArtifact, Vec<Record>), PipelineError> {
    let artifact = artifact::read_artifact(path).await?;
    let records = artifact.data.iter().cloned().map(normalize_record).collect();
    Ok((artifact, records))
}

/// Like [`load_records`] but an empty record list is an error for `stage`.
pub(crate) async fn load_nonempty(stage: StageId, path: &Path) -> Result<(StageArtifact, Vec<Record>), PipelineError> {
    let (artifact, records) = load_records(path).await?;
    if records.is_empty() {
        return Err(PipelineError::missing(
            stage,
            format!("{} has no records", path.display()),
        ));
    }
    Ok((artifact, records))
}

/// Keep only the named columns, in that order, as strings.
pub(crate) fn project(records: &[Record], columns: &[&str]) -> Vec<Record> {
    records
        .iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| (c.to_string(), Value::String(field_str(r, c))))
                .collect()
        })
        .collect()
}

/// Drop one column from every record.
pub(crate) fn without_column(records: &[Record], column: &str) -> Vec<Record> {
    records
        .iter()
        .map(|r| {
            let mut r = r.clone();
            r.remove(column);
            r
        })
        .collect()
}

pub(crate) const POINT_COLUMNS: [&str; 7] = [
    "PointId",
    "chapter",
    "subchapter",
    "topic",
    "subtopic",
    "subsubtopic",
    "Points",
];

pub(crate) fn to_pretty(value: &impl Serialize) -> Result<String, PipelineError> {
    serde_json::to_string_pretty(value).map_err(|e| PipelineError::Internal(e.to_string()))
}

/// Companion file for a raw model reply.
pub(crate) fn raw_reply_path(ctx: &PipelineContext, stem: &str) -> PathBuf {
    ctx.output_dir().join(format!("{stem}.txt"))
}

/// One model call whose reply must contain JSON.
///
/// The raw reply is saved before extraction. A reply with no recoverable
/// JSON, or a recoverable provider failure, is retried up to the configured
/// attempt budget.
pub(crate) async fn single_call_json(
    ctx: &PipelineContext,
    stage: StageId,
    prompt: &str,
    system_prompt: Option<&str>,
    model: &str,
    raw_stem: &str,
) -> Result<Value, PipelineError> {
    single_call(ctx, stage, prompt, system_prompt, model, raw_stem, extract_or_reload).await
}

/// One model call whose saved reply is read by `read`; `None` from `read`
/// counts as an unusable reply and is retried.
pub(crate) async fn single_call<T>(
    ctx: &PipelineContext,
    stage: StageId,
    prompt: &str,
    system_prompt: Option<&str>,
    model: &str,
    raw_stem: &str,
    read: impl Fn(&str, &Path) -> Option<T>,
) -> Result<T, PipelineError> {
    let policy = RetryPolicy::fixed(ctx.config.single_call_attempts, ctx.config.pacing_delay);
    let raw_path = raw_reply_path(ctx, raw_stem);
    let label = format!("Stage {stage}");
    let read = &read;
    with_retry(
        &policy,
        &ctx.cancel,
        &label,
        |attempt| {
            let raw_path = raw_path.clone();
            async move {
                if attempt > 0 {
                    info!("Stage {}: model call attempt {}", stage, attempt + 1);
                }
                ctx.phase(stage, StagePhase::InvokingModel);
                let reply = ctx
                    .client
                    .process_text(prompt, system_prompt, model, ctx.call_options())
                    .await?;
                artifact::write_atomic(&raw_path, reply.as_bytes()).await?;
                ctx.phase(stage, StagePhase::ExtractingJson);
                read(&reply, &raw_path).ok_or_else(|| PipelineError::NoUsableOutput {
                    stage: stage.to_string(),
                    total: 1,
                    first_error: UnitError::ExtractionFailed {
                        unit: "reply".into(),
                        raw_path: raw_path.display().to_string(),
                    }
                    .to_string(),
                })
            }
        },
        is_unit_recoverable,
    )
    .await
}

/// Extract from the reply, falling back to the saved companion file.
pub(crate) fn extract_or_reload(reply: &str, raw_path: &Path) -> Option<Value> {
    json_repair::extract(reply).or_else(|| match json_repair::extract_from_file(raw_path) {
        Ok(v) => v,
        Err(e) => {
            warn!("Could not reread {}: {}", raw_path.display(), e);
            None
        }
    })
}

/// Records from an extracted reply; a lone object becomes one record.
pub(crate) fn reply_records(value: &Value) -> Vec<Record> {
    match records_in(value) {
        Some(records) if !records.is_empty() => records,
        _ => match value {
            Value::Object(map) => vec![map.clone()],
            _ => Vec::new(),
        },
    }
}

/// Errors that fail one unit but let the stage carry on.
///
/// Cancellation, configuration mistakes and write failures stop the stage.
pub(crate) fn is_unit_recoverable(e: &PipelineError) -> bool {
    !matches!(
        e,
        PipelineError::Cancelled
            | PipelineError::InvalidConfig(_)
            | PipelineError::OutputWriteFailed { .. }
            | PipelineError::Internal(_)
    )
}

/// Skip reason for stages that need the Word file.
pub(crate) fn word_file_skip_reason(ctx: &PipelineContext) -> Option<String> {
    match &ctx.config.word_file {
        None => Some("no Word file configured".into()),
        Some(p) if !p.exists() => Some(format!("Word file {} not found", p.display())),
        Some(_) => None,
    }
}

/// The Word file's text, wrapped for the model.
pub(crate) async fn word_content(ctx: &PipelineContext, stage: StageId) -> Result<String, PipelineError> {
    let path = ctx
        .config
        .word_file
        .as_deref()
        .ok_or_else(|| PipelineError::missing(stage, "no Word file configured"))?;
    let text = word::read_word(path).await?;
    Ok(word::prepare_word_for_model(&text, &format!("Stage {stage}")))
}

/// Run one text part per batch of `size` records and left-join the replies
/// onto `records` by PointId.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn batched_join(
    ctx: &PipelineContext,
    stage: StageId,
    model: &str,
    raw_stem: &str,
    records: &[Record],
    size: usize,
    prompt_for: impl Fn(usize, &[Record]) -> Result<String, PipelineError>,
    columns: &[join::JoinColumn],
) -> Result<(join::JoinResult, crate::chunked::PartsOutcome), PipelineError> {
    let mut parts = Vec::new();
    for (i, batch) in records.chunks(size.max(1)).enumerate() {
        let label = format!("records {}-{}", i * size + 1, i * size + batch.len());
        parts.push(crate::chunked::Part::text(i + 1, label, prompt_for(i + 1, batch)?));
    }
    info!("Stage {}: {} records in {} part(s)", stage, records.len(), parts.len());
    let outcome = crate::chunked::ChunkedDocumentProcessor::new(ctx, stage, model, raw_stem)
        .process(parts)
        .await?;
    outcome.require_any(stage)?;

    ctx.phase(stage, StagePhase::Merging);
    let model_rows: Vec<Record> = outcome.records().into_iter().flatten().collect();
    let joined = join::left_join(records, &model_rows, columns);
    if joined.unmatched_model_rows > 0 {
        warn!(
            "Stage {}: {} model row(s) reference unknown PointIds",
            stage, joined.unmatched_model_rows
        );
    }
    Ok((joined, outcome))
}

/// Persist an artifact and report its path.
pub(crate) async fn persist(
    ctx: &PipelineContext,
    stage: StageId,
    path: &Path,
    artifact: &StageArtifact,
) -> Result<(), PipelineError> {
    ctx.phase(stage, StagePhase::Persisting);
    artifact::write_json(path, artifact).await?;
    info!(
        "Stage {}: wrote {} records to {}",
        stage,
        artifact.data.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_labels_round_trip() {
        for id in StageId::ALL {
            assert_eq!(id.label().parse::<StageId>().unwrap(), id);
        }
        assert_eq!("s3".parse::<StageId>().unwrap(), StageId::S3);
        assert_eq!("j".parse::<StageId>().unwrap(), StageId::J);
        assert!("Q".parse::<StageId>().is_err());
    }

    #[test]
    fn stage_list_parsing() {
        assert_eq!(
            parse_stage_list("1,2, 3,4,E,F,J,V").unwrap(),
            StageId::DEFAULT_CHAIN.to_vec()
        );
        assert!(parse_stage_list("1,W").is_err());
    }

    #[test]
    fn dependencies_point_backwards_in_full_order() {
        let order: Vec<StageId> = [
            StageId::S1,
            StageId::S2,
            StageId::S3,
            StageId::S4,
            StageId::E,
            StageId::F,
            StageId::J,
            StageId::H,
            StageId::M,
            StageId::V,
            StageId::L,
            StageId::X,
            StageId::Y,
            StageId::Z,
        ]
        .to_vec();
        for (i, id) in order.iter().enumerate() {
            for dep in id.dependencies() {
                let j = order.iter().position(|s| *s == dep.stage).unwrap();
                assert!(j < i, "{id} depends on later stage {}", dep.stage);
            }
        }
    }

    #[test]
    fn file_names() {
        assert_eq!(StageId::E.output_file_name("105003", "x"), "e105003.json");
        assert_eq!(StageId::F.output_file_name("105003", "x"), "f.json");
        assert_eq!(StageId::J.output_file_name("105003", "x"), "a105003.json");
        assert_eq!(StageId::H.output_file_name("105003", "x"), "ac105003.json");
        assert_eq!(
            StageId::V.output_file_name("105003", "Cell Biology"),
            "b105003+Cell_Biology.json"
        );
        assert_eq!(
            StageId::Z.output_file_name("105003", "Cells: part 1"),
            "z105003+Cells_part_1.rtf"
        );
        assert_eq!(StageId::Z.output_file_name("105003", ""), "z105003.rtf");
    }

    #[test]
    fn chapter_name_cleaning() {
        assert_eq!(clean_chapter_name("  a/b  c?? "), "a_b_c");
        assert_eq!(clean_chapter_name("پوست و مو"), "پوست_و_مو");
    }

    #[test]
    fn projection_fills_missing_columns() {
        let r: Record = json!({"PointId": "1050030001", "Points": 5, "Imp": "3"})
            .as_object()
            .unwrap()
            .clone();
        let p = project(&[r], &["PointId", "topic", "Points"]);
        assert_eq!(
            Value::Object(p[0].clone()),
            json!({"PointId": "1050030001", "topic": "", "Points": "5"})
        );
    }

    #[test]
    fn reply_records_wraps_single_object() {
        assert_eq!(reply_records(&json!({"Chapter": "x"})).len(), 1);
        assert_eq!(reply_records(&json!({"data": [{"a": 1}, {"a": 2}]})).len(), 2);
        assert!(reply_records(&json!("text")).is_empty());
    }

    #[test]
    fn recoverable_classification() {
        assert!(is_unit_recoverable(&PipelineError::RateLimitExceeded {
            provider: "gemini".into()
        }));
        assert!(!is_unit_recoverable(&PipelineError::Cancelled));
        assert!(!is_unit_recoverable(&PipelineError::InvalidConfig("x".into())));
    }
}

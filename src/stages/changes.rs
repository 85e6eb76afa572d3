//! Stage X: what changed between the old edition and the current points.
//!
//! The old-edition PDF is transcribed once, in two page halves, and cached
//! as `{old_stem}_old_extracted.json` next to the other artifacts; Stage Y
//! reads the same cache. Stage J records (without `Imp`) then go to the
//! model in batches, each alongside the full old-edition text, and every
//! reported change is normalised to `{PointId, ChangeDescription, ChangeType}`.

use super::{load_nonempty, load_records, persist, reply_records, to_pretty, without_column};
use super::{StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{value_to_string, Record, StageArtifact};
use crate::chunked::{merge_rows, ChunkedDocumentProcessor, PageSource, Part};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

pub struct ChangesStage;

const POINT_ID_KEYS: [&str; 6] = ["POINTID", "PointId", "pointID", "pointid", "PointID", "point_id"];
const DESCRIPTION_KEYS: [&str; 5] = [
    "Change Description",
    "change description",
    "ChangeDescription",
    "description",
    "Description",
];
const TYPE_KEYS: [&str; 5] = ["Change Type", "change type", "ChangeType", "type", "Type"];

/// The first alias whose value is not null.
fn first_present(record: &Record, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| record.get(*k).filter(|v| !v.is_null()))
        .map(value_to_string)
        .unwrap_or_default()
}

/// Canonical change triple. Present values keep their string form, so a
/// numeric `0` stays `"0"`.
pub fn normalize_change(raw: &Record) -> Record {
    let mut out = Record::new();
    out.insert("PointId".into(), Value::String(first_present(raw, &POINT_ID_KEYS)));
    out.insert(
        "ChangeDescription".into(),
        Value::String(first_present(raw, &DESCRIPTION_KEYS)),
    );
    out.insert("ChangeType".into(), Value::String(first_present(raw, &TYPE_KEYS)));
    out
}

fn old_edition_pdf(ctx: &PipelineContext) -> Option<&std::path::Path> {
    ctx.config.old_book_pdf.as_deref().filter(|p| p.exists())
}

/// Skip reason shared by the stages that read the old edition.
pub(crate) fn old_edition_skip_reason(ctx: &PipelineContext) -> Option<String> {
    match &ctx.config.old_book_pdf {
        None => Some("no old-edition PDF configured".into()),
        Some(p) if !p.exists() => Some(format!("old-edition PDF {} not found", p.display())),
        Some(_) => None,
    }
}

/// Where the old-edition transcription is cached.
pub fn old_edition_cache_path(ctx: &PipelineContext) -> Option<PathBuf> {
    let pdf = ctx.config.old_book_pdf.as_deref()?;
    let stem = pdf.file_stem()?.to_string_lossy();
    Some(ctx.output_dir().join(format!("{stem}_old_extracted.json")))
}

/// Old-edition rows, from the cache when present, otherwise transcribed
/// now and cached.
pub(crate) async fn old_edition_rows(ctx: &PipelineContext, stage: StageId) -> Result<Vec<Record>, PipelineError> {
    let pdf = old_edition_pdf(ctx)
        .ok_or_else(|| PipelineError::missing(stage, "old-edition PDF not available"))?;
    let cache = old_edition_cache_path(ctx)
        .ok_or_else(|| PipelineError::missing(stage, "old-edition PDF has no file name"))?;
    if cache.exists() {
        let (_, rows) = load_records(&cache).await?;
        if !rows.is_empty() {
            info!("Stage {}: reusing {} old-edition rows from {}", stage, rows.len(), cache.display());
            return Ok(rows);
        }
    }

    let config = &ctx.config;
    let (prompt, model) = config
        .prompt(PromptKey::StageXExtraction)
        .filter(|(p, _)| !p.trim().is_empty())
        .unwrap_or((prompts::DEFAULT_OLD_EDITION_PROMPT, config.default_model.as_str()));
    let stem = cache
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let chunker = ChunkedDocumentProcessor::new(ctx, stage, model, stem);
    let parts = chunker.page_halves(pdf, prompt, PageSource::ExtractText).await?;
    let outcome = chunker.process(parts).await?;
    outcome.require_any(stage)?;
    let rows = merge_rows(outcome.records(), Some("Number"), config.drop_overlapping_rows);

    let artifact = StageArtifact::new("old_extracted", rows)
        .with_meta("source_pdf", pdf.display().to_string())
        .with_meta("model", model)
        .with_meta("failed_parts", outcome.failures.len());
    persist(ctx, stage, &cache, &artifact).await?;
    Ok(artifact.data)
}

#[async_trait]
impl StageProcessor for ChangesStage {
    fn id(&self) -> StageId {
        StageId::X
    }

    fn skip_reason(&self, ctx: &PipelineContext) -> Option<String> {
        old_edition_skip_reason(ctx)
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::X, StagePhase::LoadingInputs);
        let (_, records) = load_nonempty(StageId::X, inputs.require(StageId::X, StageId::J)?).await?;
        let current = without_column(&records, "Imp");
        let old_rows = old_edition_rows(ctx, StageId::X).await?;
        info!(
            "Stage X: {} current records against {} old-edition rows",
            current.len(),
            old_rows.len()
        );

        ctx.phase(StageId::X, StagePhase::BuildingPrompt);
        let (system, model) = config.require_prompt(PromptKey::StageXChanges, StageId::X)?;
        let system = prompts::fill_template(system, &config.chapter_name, None);
        let size = config.changes_batch_size.max(1);
        let mut parts = Vec::new();
        for (i, batch) in current.chunks(size).enumerate() {
            let text = to_pretty(&json!({"current_data": batch, "old_book_data": old_rows}))?;
            parts.push(
                Part::text(i + 1, format!("records {}-{}", i * size + 1, i * size + batch.len()), text)
                    .with_system_prompt(system.clone()),
            );
        }

        let stem = format!("x{}", config.book_chapter());
        let outcome = ChunkedDocumentProcessor::new(ctx, StageId::X, model, stem)
            .process(parts)
            .await?;
        outcome.require_any(StageId::X)?;

        ctx.phase(StageId::X, StagePhase::Merging);
        let changes: Vec<Record> = outcome
            .values
            .iter()
            .flat_map(|(_, v)| reply_records(v))
            .map(|c| normalize_change(&c))
            .collect();
        info!("Stage X: {} change(s)", changes.len());

        let path = StageId::X.output_path(config);
        let artifact = StageArtifact::new("X", changes)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("chapter", config.chapter_name.clone())
            .with_meta("old_edition_rows", old_rows.len())
            .with_meta("total_parts", outcome.total)
            .with_meta("failed_parts", outcome.failures.len());
        persist(ctx, StageId::X, &path, &artifact).await?;
        let mut result = StageOutcome::new(path, artifact.data.len()).with_failures(outcome.failures);
        if let Some(cache) = old_edition_cache_path(ctx) {
            result = result.with_extra(cache);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn key_variants_normalise() {
        let c = normalize_change(&rec(json!({
            "POINTID": 1050030004u64,
            "change description": "reworded",
            "Type": "edit"
        })));
        assert_eq!(
            Value::Object(c),
            json!({"PointId": "1050030004", "ChangeDescription": "reworded", "ChangeType": "edit"})
        );
    }

    #[test]
    fn zero_survives_and_missing_is_empty() {
        let c = normalize_change(&rec(json!({"PointId": "1050030001", "Change Type": 0})));
        assert_eq!(c["ChangeType"], json!("0"));
        assert_eq!(c["ChangeDescription"], json!(""));
        let c = normalize_change(&rec(json!({"ChangeDescription": 0, "ChangeType": null})));
        assert_eq!(c["ChangeDescription"], json!("0"));
        assert_eq!(c["ChangeType"], json!(""));
        assert_eq!(c["PointId"], json!(""));
    }

    #[test]
    fn null_alias_falls_through_to_the_next() {
        let c = normalize_change(&rec(json!({
            "PointId": null,
            "point_id": "1050030002",
            "Change Type": null,
            "ChangeType": "edit"
        })));
        assert_eq!(c["PointId"], json!("1050030002"));
        assert_eq!(c["ChangeType"], json!("edit"));
    }
}

//! Stage E: image notes appended after the stage-4 points.
//!
//! The model sees the OCR rows (which describe figures and tables) next to
//! the stage-4 points and returns one record per image reference. Those
//! records are saved twice: verbatim, captions included, as the `_filepic`
//! catalog input for Stage F, and reshaped as points with fresh PointIds
//! appended to the stage-4 list.

use super::{load_nonempty, load_records, persist, reply_records, single_call_json, to_pretty};
use super::{StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{value_to_string, Record, StageArtifact};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::point_id;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct ImageNotesStage;

/// `e{BBBCCC}_filepic.json` beside the Stage E artifact.
pub fn filepic_path(stage_e_path: &Path) -> PathBuf {
    let stem = stage_e_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stage_e_path.with_file_name(format!("{stem}_filepic.json"))
}

/// Reshape one model note as a point: `caption` is dropped and the image
/// reference in `point_text` becomes `Points`.
pub fn note_to_point(note: &Record, point_id: String) -> Record {
    let mut out = Record::with_capacity(note.len() + 1);
    out.insert("PointId".into(), Value::String(point_id));
    for (k, v) in note {
        if !matches!(k.as_str(), "caption" | "point_text" | "PointId" | "Points") {
            out.insert(k.clone(), v.clone());
        }
    }
    let reference = note
        .get("point_text")
        .or_else(|| note.get("Points"))
        .map(value_to_string)
        .unwrap_or_default();
    out.insert("Points".into(), Value::String(reference));
    out
}

#[async_trait]
impl StageProcessor for ImageNotesStage {
    fn id(&self) -> StageId {
        StageId::E
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::E, StagePhase::LoadingInputs);
        let ocr_path = inputs.require(StageId::E, StageId::S1)?;
        let points_path = inputs.require(StageId::E, StageId::S4)?;
        let (_, ocr_rows) = load_records(ocr_path).await?;
        let (_, points) = load_nonempty(StageId::E, points_path).await?;
        let next_id = point_id::next_after(&points)?.ok_or_else(|| PipelineError::InvalidPointId {
            value: points
                .last()
                .and_then(|r| r.get("PointId"))
                .map(value_to_string)
                .unwrap_or_default(),
        })?;
        info!(
            "Stage E: {} stage-4 points, image notes start at {}",
            points.len(),
            next_id
        );

        ctx.phase(StageId::E, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::StageE, StageId::E)?;
        let prompt = format!(
            "{}{}{}",
            prompts::fill_template(template, &config.chapter_name, None),
            prompts::section("OCR EXTRACTION JSON (STAGE 1)", &to_pretty(&ocr_rows)?),
            prompts::section("STAGE 4 POINTS JSON (WITH PointId)", &to_pretty(&points)?)
        );

        let stem = format!("e{}_stage_e", config.book_chapter());
        let reply = single_call_json(ctx, StageId::E, &prompt, None, model, &stem).await?;
        let notes = reply_records(&reply);
        if notes.is_empty() {
            return Err(PipelineError::NoUsableOutput {
                stage: StageId::E.to_string(),
                total: 1,
                first_error: "model returned no image-note records".into(),
            });
        }

        ctx.phase(StageId::E, StagePhase::Merging);
        let with_caption = notes
            .iter()
            .filter(|n| n.get("caption").is_some_and(|c| !value_to_string(c).is_empty()))
            .count();
        let mut appended = Vec::with_capacity(notes.len());
        for (i, note) in notes.iter().enumerate() {
            appended.push(note_to_point(note, next_id.advance(i)?.to_string()));
        }
        let first_image = next_id.to_string();
        let last_id = next_id.advance(notes.len() - 1)?.to_string();

        let path = StageId::E.output_path(config);
        let filepic = filepic_path(&path);
        let filepic_artifact = StageArtifact::new("filepic", notes.clone())
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("records_with_caption", with_caption)
            .with_meta("model", model);
        persist(ctx, StageId::E, &filepic, &filepic_artifact).await?;

        let stage4_total = points.len();
        let mut merged = points;
        merged.extend(appended);
        let artifact = StageArtifact::new("E", merged)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("stage4_total_points", stage4_total)
            .with_meta("image_notes_count", notes.len())
            .with_meta("first_image_point_id", first_image)
            .with_meta("last_point_id", last_id)
            .with_meta("filepic_json_path", filepic.display().to_string());
        persist(ctx, StageId::E, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()).with_extra(filepic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn note_becomes_point() {
        let note = json!({
            "topic": "Membrane",
            "caption": "Lipid bilayer cross-section",
            "point_text": "تصویر 30:19"
        })
        .as_object()
        .unwrap()
        .clone();
        let p = note_to_point(&note, "1050030042".into());
        assert_eq!(
            Value::Object(p),
            json!({"PointId": "1050030042", "topic": "Membrane", "Points": "تصویر 30:19"})
        );
    }

    #[test]
    fn filepic_sits_beside_stage_e() {
        assert_eq!(
            filepic_path(Path::new("/out/e105003.json")),
            PathBuf::from("/out/e105003_filepic.json")
        );
    }
}

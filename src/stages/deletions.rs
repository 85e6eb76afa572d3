//! Stage Y: sentences of the old edition that the current OCR no longer has.

use super::changes::{old_edition_rows, old_edition_skip_reason};
use super::{load_nonempty, persist, reply_records, single_call_json, to_pretty};
use super::{StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{value_to_string, Record, StageArtifact};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

pub struct DeletionsStage;

const SENTENCE_KEYS: [&str; 6] = ["Sentence", "sentence", "text", "Text", "content", "Content"];

/// `{Number, Sentence}` rows numbered from 1 in reply order.
pub fn normalize_deletions(raw: &[Record]) -> Vec<Record> {
    raw.iter()
        .enumerate()
        .map(|(i, d)| {
            let sentence = SENTENCE_KEYS
                .iter()
                .find_map(|k| d.get(*k))
                .map(value_to_string)
                .unwrap_or_default();
            let mut out = Record::new();
            out.insert("Number".into(), Value::String((i + 1).to_string()));
            out.insert("Sentence".into(), Value::String(sentence));
            out
        })
        .collect()
}

#[async_trait]
impl StageProcessor for DeletionsStage {
    fn id(&self) -> StageId {
        StageId::Y
    }

    fn skip_reason(&self, ctx: &PipelineContext) -> Option<String> {
        old_edition_skip_reason(ctx)
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::Y, StagePhase::LoadingInputs);
        let (_, current) = load_nonempty(StageId::Y, inputs.require(StageId::Y, StageId::S1)?).await?;
        let old_rows = old_edition_rows(ctx, StageId::Y).await?;

        ctx.phase(StageId::Y, StagePhase::BuildingPrompt);
        let (system, model) = config.require_prompt(PromptKey::StageY, StageId::Y)?;
        let system = prompts::fill_template(system, &config.chapter_name, None);
        let text = to_pretty(&json!({"current_data": current, "old_book_data": old_rows}))?;

        let stem = format!("y{}_stage_y", config.book_chapter());
        let reply = single_call_json(ctx, StageId::Y, &text, Some(&system), model, &stem).await?;
        ctx.phase(StageId::Y, StagePhase::Merging);
        let deletions = normalize_deletions(&reply_records(&reply));
        if deletions.is_empty() {
            warn!("Stage Y: model reported no deletions");
        }
        info!("Stage Y: {} deleted sentence(s)", deletions.len());

        let path = StageId::Y.output_path(config);
        let artifact = StageArtifact::new("Y", deletions)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("chapter", config.chapter_name.clone())
            .with_meta("current_rows", current.len())
            .with_meta("old_edition_rows", old_rows.len());
        persist(ctx, StageId::Y, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_in_order_with_key_variants() {
        let raw: Vec<Record> = [
            json!({"sentence": "first"}),
            json!({"Content": 0}),
            json!({"other": "x"}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect();
        let rows = normalize_deletions(&raw);
        assert_eq!(Value::Object(rows[0].clone()), json!({"Number": "1", "Sentence": "first"}));
        assert_eq!(rows[1]["Sentence"], json!("0"));
        assert_eq!(Value::Object(rows[2].clone()), json!({"Number": "3", "Sentence": ""}));
    }
}

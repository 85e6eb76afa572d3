//! Stage H: one multiple-choice flashcard per Stage J point.

use super::join::JoinColumn;
use super::{batched_join, load_nonempty, load_records, persist, project, to_pretty};
use super::{StageId, StageInputs, StageOutcome, StageProcessor, POINT_COLUMNS};
use crate::artifact::{Record, StageArtifact};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

pub struct FlashcardStage;

/// Answer level every card points back to.
pub const DEFAULT_MAIN_ANSWER: &str = "زیرعنوان";

const FLASHCARD_COLUMNS: [JoinColumn; 6] = [
    JoinColumn::new("Qtext", &["question", "Question", "qtext"]),
    JoinColumn::new("Choice1", &["choice1", "option1"]),
    JoinColumn::new("Choice2", &["choice2", "option2"]),
    JoinColumn::new("Choice3", &["choice3", "option3"]),
    JoinColumn::new("Choice4", &["choice4", "option4"]),
    JoinColumn::new("Correct", &["correct", "answer", "Answer"]),
];

/// Column order of a flashcard record.
pub const CARD_COLUMNS: [&str; 16] = [
    "PointId",
    "chapter",
    "subchapter",
    "topic",
    "subtopic",
    "subsubtopic",
    "Points",
    "Type",
    "Imp",
    "Qtext",
    "Choice1",
    "Choice2",
    "Choice3",
    "Choice4",
    "Correct",
    "Mainanswer",
];

fn to_cards(joined: &[Record]) -> Vec<Record> {
    project(joined, &CARD_COLUMNS[..15])
        .into_iter()
        .map(|mut r| {
            r.insert("Mainanswer".into(), Value::from(DEFAULT_MAIN_ANSWER));
            r
        })
        .collect()
}

#[async_trait]
impl StageProcessor for FlashcardStage {
    fn id(&self) -> StageId {
        StageId::H
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::H, StagePhase::LoadingInputs);
        let (_, records) = load_nonempty(StageId::H, inputs.require(StageId::H, StageId::J)?).await?;
        let catalog = match inputs.get(StageId::F) {
            Some(path) => load_records(path).await.map(|(_, r)| r).unwrap_or_else(|e| {
                warn!("Stage H: continuing without image catalog: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        ctx.phase(StageId::H, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::StageH, StageId::H)?;
        let base = prompts::fill_template(template, &config.chapter_name, None);
        let catalog_section = if catalog.is_empty() {
            String::new()
        } else {
            prompts::section("IMAGE CATALOG (STAGE F JSON)", &to_pretty(&catalog)?)
        };
        let columns: Vec<&str> = POINT_COLUMNS.iter().copied().chain(["Type", "Imp"]).collect();
        let prompt_for = |part: usize, batch: &[Record]| -> Result<String, PipelineError> {
            Ok(format!(
                "{base}{catalog_section}{}{}",
                prompts::section(
                    &format!("POINTS, PART {part} (JSON)"),
                    &to_pretty(&project(batch, &columns))?
                ),
                prompts::FLASHCARD_OUTPUT_SHAPE
            ))
        };

        let stem = format!("ac{}", config.book_chapter());
        let (joined, outcome) = batched_join(
            ctx,
            StageId::H,
            model,
            &stem,
            &records,
            config.flashcard_batch_size,
            prompt_for,
            &FLASHCARD_COLUMNS,
        )
        .await?;
        if joined.matched == 0 {
            warn!("Stage H: no flashcard matched a Stage J PointId");
        }
        info!("Stage H: {}/{} points have flashcards", joined.matched, records.len());

        let path = StageId::H.output_path(config);
        let artifact = StageArtifact::new("H", to_cards(&joined.records))
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("chapter", config.chapter_name.clone())
            .with_meta("matched_records", joined.matched)
            .with_meta("unmatched_model_rows", joined.unmatched_model_rows)
            .with_meta("total_parts", outcome.total)
            .with_meta("failed_parts", outcome.failures.len());
        persist(ctx, StageId::H, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()).with_failures(outcome.failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::join::left_join;
    use serde_json::json;

    #[test]
    fn cards_have_sixteen_columns_in_order() {
        let upstream = vec![json!({"PointId": "1050030001", "topic": "Cells", "Imp": "2", "Type": "def"})
            .as_object()
            .unwrap()
            .clone()];
        let model = vec![json!({"PointId": "1050030001", "question": "What?", "Correct": 2})
            .as_object()
            .unwrap()
            .clone()];
        let joined = left_join(&upstream, &model, &FLASHCARD_COLUMNS);
        let cards = to_cards(&joined.records);
        let keys: Vec<&str> = cards[0].keys().map(String::as_str).collect();
        assert_eq!(keys, CARD_COLUMNS);
        assert_eq!(cards[0]["Qtext"], json!("What?"));
        assert_eq!(cards[0]["Correct"], json!("2"));
        assert_eq!(cards[0]["Choice3"], json!(""));
        assert_eq!(cards[0]["Mainanswer"], json!(DEFAULT_MAIN_ANSWER));
    }
}

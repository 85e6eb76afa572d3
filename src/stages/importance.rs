//! Stage J: importance level and point type for every Stage E point.

use super::join::JoinColumn;
use super::{batched_join, load_nonempty, load_records, persist, project, to_pretty, word_content};
use super::{word_file_skip_reason, StageId, StageInputs, StageOutcome, StageProcessor, POINT_COLUMNS};
use crate::artifact::{Record, StageArtifact};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ImportanceStage;

pub const IMPORTANCE_COLUMNS: [JoinColumn; 2] = [
    JoinColumn::new("Imp", &["importance_level", "importance", "IMP", "imp"]),
    JoinColumn::new("Type", &["point_type", "type", "TYPE"]),
];

#[async_trait]
impl StageProcessor for ImportanceStage {
    fn id(&self) -> StageId {
        StageId::J
    }

    fn skip_reason(&self, ctx: &PipelineContext) -> Option<String> {
        word_file_skip_reason(ctx)
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::J, StagePhase::LoadingInputs);
        let (_, records) = load_nonempty(StageId::J, inputs.require(StageId::J, StageId::E)?).await?;
        let word = word_content(ctx, StageId::J).await?;
        let catalog = match inputs.get(StageId::F) {
            Some(path) => match load_records(path).await {
                Ok((_, rows)) => rows,
                Err(e) => {
                    warn!("Stage J: continuing without image catalog: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        ctx.phase(StageId::J, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::StageJ, StageId::J)?;
        let base = prompts::fill_template(template, &config.chapter_name, None);
        let catalog_section = if catalog.is_empty() {
            String::new()
        } else {
            prompts::section("IMAGE CATALOG (STAGE F JSON)", &to_pretty(&catalog)?)
        };
        let word_section = prompts::section("WORD DOCUMENT", &word);
        let prompt_for = |part: usize, batch: &[Record]| -> Result<String, PipelineError> {
            Ok(format!(
                "{base}{word_section}{catalog_section}{}{}",
                prompts::section(
                    &format!("POINTS, PART {part} (JSON)"),
                    &to_pretty(&project(batch, &POINT_COLUMNS))?
                ),
                prompts::IMPORTANCE_OUTPUT_SHAPE
            ))
        };

        let stem = format!("a{}", config.book_chapter());
        let (joined, outcome) = batched_join(
            ctx,
            StageId::J,
            model,
            &stem,
            &records,
            config.importance_batch_size,
            prompt_for,
            &IMPORTANCE_COLUMNS,
        )
        .await?;
        info!(
            "Stage J: {}/{} points classified",
            joined.matched,
            records.len()
        );

        let path = StageId::J.output_path(config);
        let artifact = StageArtifact::new("J", joined.records)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("matched_records", joined.matched)
            .with_meta("unmatched_model_rows", joined.unmatched_model_rows)
            .with_meta("image_catalog_used", !catalog.is_empty())
            .with_meta("total_parts", outcome.total)
            .with_meta("failed_parts", outcome.failures.len());
        persist(ctx, StageId::J, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()).with_failures(outcome.failures))
    }
}

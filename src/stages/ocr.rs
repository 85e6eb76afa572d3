//! Stage 1: OCR extraction of the source PDF, in two page-range halves.

use super::{persist, StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{self, StageArtifact};
use crate::chunked::{merge_rows, ChunkedDocumentProcessor, PageSource};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use tracing::info;

pub struct OcrStage;

#[async_trait]
impl StageProcessor for OcrStage {
    fn id(&self) -> StageId {
        StageId::S1
    }

    async fn run(&self, ctx: &PipelineContext, _inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::S1, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::Stage1, StageId::S1)?;
        let prompt = prompts::fill_template(template, &config.chapter_name, None);

        let stem = format!("s1_{}", config.book_chapter());
        let chunker = ChunkedDocumentProcessor::new(ctx, StageId::S1, model, &stem);
        let parts = chunker
            .page_halves(&config.pdf_path, &prompt, PageSource::Attach)
            .await?;
        let outcome = chunker.process(parts).await?;
        outcome.require_any(StageId::S1)?;

        ctx.phase(StageId::S1, StagePhase::Merging);
        let rows = merge_rows(outcome.records(), Some("Number"), config.drop_overlapping_rows);
        info!("Stage 1: {} rows after dedup and sort", rows.len());

        let json_path = StageId::S1.output_path(config);
        let csv_path = json_path.with_extension("csv");
        let pdf_name = config
            .pdf_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let artifact = StageArtifact::new("1", rows)
            .with_meta("source_pdf", pdf_name)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("total_parts", outcome.total)
            .with_meta("failed_parts", outcome.failures.len());
        persist(ctx, StageId::S1, &json_path, &artifact).await?;

        let mut result = StageOutcome::new(json_path, artifact.data.len())
            .with_failures(outcome.failures);
        if artifact::write_csv(&csv_path, &artifact.data).await? {
            result = result.with_extra(csv_path);
        }
        Ok(result)
    }
}

//! Stage Z: a rich-text report that folds the Stage X changes and Stage Y
//! deletions into the current Stage J points.
//!
//! Unlike every other stage the product is not JSON. The reply may still
//! wrap the document in a JSON object or a fenced block, so
//! [`extract_rich_text`] peels those off before the `.rtf` file is written.

use super::{load_nonempty, load_records, single_call, to_pretty, without_column};
use super::{StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact;
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::json_repair;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

pub struct RichTextStage;

const TEXT_FIELDS: [&str; 3] = ["richtext", "content", "text"];

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:rtf|richtext)?\s*\n(.*?)```").unwrap());

/// The document inside a reply: a `richtext`/`content`/`text` field of a
/// JSON object, else the first fenced block, else the trimmed reply.
pub fn extract_rich_text(reply: &str) -> String {
    if let Some(serde_json::Value::Object(map)) = json_repair::extract(reply) {
        let field = TEXT_FIELDS
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
            .filter(|s| !s.trim().is_empty());
        if let Some(text) = field {
            return text.to_string();
        }
    }
    if let Some(body) = RE_FENCE.captures(reply).and_then(|c| c.get(1)) {
        return body.as_str().trim().to_string();
    }
    reply.trim().to_string()
}

#[async_trait]
impl StageProcessor for RichTextStage {
    fn id(&self) -> StageId {
        StageId::Z
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::Z, StagePhase::LoadingInputs);
        let (_, records) = load_nonempty(StageId::Z, inputs.require(StageId::Z, StageId::J)?).await?;
        let (_, changes) = load_records(inputs.require(StageId::Z, StageId::X)?).await?;
        let (_, deletions) = load_records(inputs.require(StageId::Z, StageId::Y)?).await?;
        info!(
            "Stage Z: {} records, {} change(s), {} deletion(s)",
            records.len(),
            changes.len(),
            deletions.len()
        );

        ctx.phase(StageId::Z, StagePhase::BuildingPrompt);
        let (system, model) = config.require_prompt(PromptKey::StageZ, StageId::Z)?;
        let system = prompts::fill_template(system, &config.chapter_name, None);
        let text = to_pretty(&json!({
            "current_data": without_column(&records, "Imp"),
            "changes": changes,
            "deletions": deletions,
        }))?;

        let stem = format!("z{}_stage_z", config.book_chapter());
        let document = single_call(ctx, StageId::Z, &text, Some(&system), model, &stem, |reply, _| {
            Some(extract_rich_text(reply)).filter(|s| !s.is_empty())
        })
        .await?;
        if !document.trim_start().starts_with("{\\rtf") {
            warn!("Stage Z: reply does not start with an RTF header, writing it as-is");
        }

        let path = StageId::Z.output_path(config);
        ctx.phase(StageId::Z, StagePhase::Persisting);
        artifact::write_atomic(&path, document.as_bytes()).await?;
        info!("Stage Z: wrote {} bytes to {}", document.len(), path.display());
        Ok(StageOutcome::new(path, 1))
    }
}

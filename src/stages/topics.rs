//! Stage M: the chapter's topic index. No model call.

use super::{load_nonempty, persist, StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{field_str, Record, StageArtifact};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

pub struct TopicIndexStage;

/// Distinct `(chapter, subchapter, topic)` triples in first-seen order.
pub fn unique_topics(records: &[Record]) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(|r| {
            let key = (
                field_str(r, "chapter"),
                field_str(r, "subchapter"),
                field_str(r, "topic"),
            );
            if !seen.insert(key.clone()) {
                return None;
            }
            let mut out = Record::new();
            out.insert("chapter".into(), Value::String(key.0));
            out.insert("subchapter".into(), Value::String(key.1));
            out.insert("topic".into(), Value::String(key.2));
            Some(out)
        })
        .collect()
}

#[async_trait]
impl StageProcessor for TopicIndexStage {
    fn id(&self) -> StageId {
        StageId::M
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        ctx.phase(StageId::M, StagePhase::LoadingInputs);
        let h_path = inputs.require(StageId::M, StageId::H)?;
        let (_, records) = load_nonempty(StageId::M, h_path).await?;

        ctx.phase(StageId::M, StagePhase::Merging);
        let topics = unique_topics(&records);

        let path = StageId::M.output_path(&ctx.config);
        let artifact = StageArtifact::new("M", topics)
            .with_meta("book_chapter", ctx.config.book_chapter())
            .with_meta("source_stage_h", h_path.display().to_string())
            .with_meta("source_records", records.len());
        persist(ctx, StageId::M, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_seen_order_without_duplicates() {
        let records: Vec<Record> = [
            json!({"chapter": "c", "subchapter": "s1", "topic": "t1", "Points": "a"}),
            json!({"chapter": "c", "subchapter": "s1", "topic": "t1", "Points": "b"}),
            json!({"chapter": "c", "subchapter": "s2", "topic": "t1"}),
            json!({"chapter": "c", "subchapter": "s1", "topic": "t0"}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect();
        let topics = unique_topics(&records);
        assert_eq!(topics.len(), 3);
        assert_eq!(
            Value::Object(topics[1].clone()),
            json!({"chapter": "c", "subchapter": "s2", "topic": "t1"})
        );
        assert_eq!(topics[2]["topic"], json!("t0"));
    }
}

//! Stage L: a per-topic chapter overview from the Stage J points and the
//! Stage V questions.

use super::{load_nonempty, load_records, persist, reply_records, single_call_json, to_pretty};
use super::{StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{field_str, Record, StageArtifact};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

pub struct OverviewStage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub chapter: String,
    pub subchapter: String,
    pub topic: String,
    pub num_points: usize,
    pub num_questions: usize,
}

/// The statistics block handed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverviewContext {
    pub topics: Vec<TopicStats>,
    pub total_topics: usize,
    pub total_points: usize,
    pub total_questions: usize,
}

impl OverviewContext {
    /// Count points and questions per `(chapter, subchapter, topic)`, topics
    /// in first-seen order, points first.
    pub fn build(points: &[Record], questions: &[Record]) -> Self {
        let mut topics: Vec<TopicStats> = Vec::new();
        let mut index: HashMap<(String, String, String), usize> = HashMap::new();
        let mut slot = |r: &Record| {
            let key = (
                field_str(r, "chapter"),
                field_str(r, "subchapter"),
                field_str(r, "topic"),
            );
            *index.entry(key.clone()).or_insert_with(|| {
                topics.push(TopicStats {
                    chapter: key.0,
                    subchapter: key.1,
                    topic: key.2,
                    num_points: 0,
                    num_questions: 0,
                });
                topics.len() - 1
            })
        };
        let point_slots: Vec<usize> = points.iter().map(&mut slot).collect();
        let question_slots: Vec<usize> = questions.iter().map(&mut slot).collect();
        for i in point_slots {
            topics[i].num_points += 1;
        }
        for i in question_slots {
            topics[i].num_questions += 1;
        }

        Self {
            total_topics: topics.len(),
            total_points: points.len(),
            total_questions: questions.len(),
            topics,
        }
    }
}

#[async_trait]
impl StageProcessor for OverviewStage {
    fn id(&self) -> StageId {
        StageId::L
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::L, StagePhase::LoadingInputs);
        let (_, points) = load_nonempty(StageId::L, inputs.require(StageId::L, StageId::J)?).await?;
        let (_, questions) = load_records(inputs.require(StageId::L, StageId::V)?).await?;
        let context = OverviewContext::build(&points, &questions);
        info!(
            "Stage L: {} topics, {} points, {} questions",
            context.total_topics, context.total_points, context.total_questions
        );

        ctx.phase(StageId::L, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::StageL, StageId::L)?;
        let prompt = format!(
            "{}{}{}",
            prompts::fill_template(template, &config.chapter_name, None),
            prompts::section("CHAPTER OVERVIEW CONTEXT (JSON)", &to_pretty(&context)?),
            prompts::OVERVIEW_OUTPUT_SHAPE
        );

        let stem = format!("o{}_stage_l", config.book_chapter());
        let reply = single_call_json(ctx, StageId::L, &prompt, None, model, &stem).await?;
        ctx.phase(StageId::L, StagePhase::Merging);
        let records = reply_records(&reply);
        if records.is_empty() {
            return Err(PipelineError::NoUsableOutput {
                stage: StageId::L.to_string(),
                total: 1,
                first_error: "model returned no overview records".into(),
            });
        }

        let path = StageId::L.output_path(config);
        let artifact = StageArtifact::new("L", records)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("total_topics", context.total_topics)
            .with_meta("total_points", context.total_points)
            .with_meta("total_questions", context.total_questions);
        persist(ctx, StageId::L, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recs(values: &[serde_json::Value]) -> Vec<Record> {
        values.iter().map(|v| v.as_object().unwrap().clone()).collect()
    }

    #[test]
    fn counts_per_topic() {
        let points = recs(&[
            json!({"chapter": "c", "subchapter": "s", "topic": "a"}),
            json!({"chapter": "c", "subchapter": "s", "topic": "a"}),
            json!({"chapter": "c", "subchapter": "s", "topic": "b"}),
        ]);
        let questions = recs(&[
            json!({"chapter": "c", "subchapter": "s", "topic": "b"}),
            json!({"chapter": "c", "subchapter": "s", "topic": "z"}),
        ]);
        let ctx = OverviewContext::build(&points, &questions);
        assert_eq!(ctx.total_topics, 3);
        assert_eq!(ctx.total_points, 3);
        assert_eq!(ctx.total_questions, 2);
        assert_eq!((ctx.topics[0].num_points, ctx.topics[0].num_questions), (2, 0));
        assert_eq!((ctx.topics[1].num_points, ctx.topics[1].num_questions), (1, 1));
        assert_eq!(ctx.topics[2].topic, "z");
    }
}

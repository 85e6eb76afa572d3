//! Stage V: the chapter test bank.
//!
//! ## Why three steps?
//!
//! Step 1 drafts questions per topic from the Word document and the Stage J
//! points. Step 2 revisits each topic with its draft in hand and refines
//! it. The optional step 3 is a single chapter-wide pass. Each step may
//! return a question under a `TestID` an earlier step already used; the
//! later step wins. The merged list is renumbered so `TestID` runs 1..n and
//! every question gets a `QId` in the chapter's PointId space.

use super::{load_nonempty, project, reply_records, single_call_json, to_pretty};
use super::{is_unit_recoverable, persist, word_content, word_file_skip_reason};
use super::{StageId, StageInputs, StageOutcome, StageProcessor, POINT_COLUMNS};
use crate::artifact::{field_str, value_to_string, Record, StageArtifact};
use crate::chunked::{ChunkedDocumentProcessor, PartsOutcome};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::{PipelineError, UnitError};
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

pub struct TestBankStage;

/// Topic bucket for records without a topic.
pub const DEFAULT_TOPIC: &str = "default";

/// Records from step 3 are only a reference sample.
const STEP3_SAMPLE: usize = 10;

/// Group records by lower-cased, trimmed topic, buckets in sorted order.
pub fn group_by_topic(records: &[Record]) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        let topic = field_str(record, "topic").trim().to_lowercase();
        let key = if topic.is_empty() {
            DEFAULT_TOPIC.to_string()
        } else {
            topic
        };
        groups.entry(key).or_default().push(record.clone());
    }
    groups
}

/// Merge question lists by `TestID`, later lists overriding earlier ones.
///
/// An overridden question keeps the position where its `TestID` first
/// appeared. Questions without a `TestID` are kept in arrival order.
pub fn merge_by_test_id(steps: &[&[Record]]) -> Vec<Record> {
    let mut merged: Vec<Record> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for question in steps.iter().flat_map(|s| s.iter()) {
        let id = question
            .get("TestID")
            .map(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match id {
            Some(id) => match position.get(&id) {
                Some(&i) => merged[i] = question.clone(),
                None => {
                    position.insert(id, merged.len());
                    merged.push(question.clone());
                }
            },
            None => merged.push(question.clone()),
        }
    }
    merged
}

/// Sequential `TestID` from 1 and `QId = {BBBCCC}{n:04}`.
pub fn renumber(questions: &mut [Record], book_chapter: &str) {
    for (i, q) in questions.iter_mut().enumerate() {
        let n = i + 1;
        q.insert("TestID".into(), Value::from(n));
        q.insert("QId".into(), Value::String(format!("{book_chapter}{n:04}")));
    }
}

fn questions_by_topic(outcome: &PartsOutcome, topics: &[String]) -> BTreeMap<String, Vec<Record>> {
    outcome
        .values
        .iter()
        .map(|(index, value)| (topics[index - 1].clone(), reply_records(value)))
        .collect()
}

#[async_trait]
impl StageProcessor for TestBankStage {
    fn id(&self) -> StageId {
        StageId::V
    }

    fn skip_reason(&self, ctx: &PipelineContext) -> Option<String> {
        word_file_skip_reason(ctx)
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        let bc = config.book_chapter();
        ctx.phase(StageId::V, StagePhase::LoadingInputs);
        let (_, records) = load_nonempty(StageId::V, inputs.require(StageId::V, StageId::J)?).await?;
        let word = word_content(ctx, StageId::V).await?;
        let columns: Vec<&str> = POINT_COLUMNS.iter().copied().chain(["Imp"]).collect();
        let groups = group_by_topic(&records);
        info!("Stage V: {} topic(s)", groups.len());

        // ── Step 1 ──
        ctx.phase(StageId::V, StagePhase::BuildingPrompt);
        let (prompt1, model1) = config.require_prompt(PromptKey::StageVStep1, StageId::V)?;
        let word_section = prompts::section("WORD DOCUMENT (TEST QUESTIONS)", &word);
        let mut topics = Vec::with_capacity(groups.len());
        let mut units = Vec::with_capacity(groups.len());
        for (topic, group) in &groups {
            let data = format!(
                "{word_section}{}",
                prompts::section("STAGE J DATA (JSON)", &to_pretty(&project(group, &columns))?)
            );
            topics.push(topic.clone());
            units.push((topic.clone(), data));
        }
        let step1 = ChunkedDocumentProcessor::new(ctx, StageId::V, model1, format!("b{bc}_stage_v_step1"));
        let parts = step1.topic_parts(prompt1, units);
        let outcome1 = step1.process(parts).await?;
        outcome1.require_any(StageId::V)?;
        let drafts = questions_by_topic(&outcome1, &topics);
        let step1_questions: Vec<Record> = drafts.values().flatten().cloned().collect();
        info!("Stage V step 1: {} question(s)", step1_questions.len());

        // ── Step 2 ──
        ctx.phase(StageId::V, StagePhase::BuildingPrompt);
        let (prompt2, model2) = config.require_prompt(PromptKey::StageVStep2, StageId::V)?;
        let mut refined_topics = Vec::new();
        let mut units = Vec::new();
        for (topic, draft) in &drafts {
            let group = &groups[topic];
            let data = format!(
                "{word_section}{}{}",
                prompts::section("STAGE J DATA (JSON)", &to_pretty(&project(group, &columns))?),
                prompts::section("STEP 1 QUESTIONS (JSON)", &to_pretty(draft)?)
            );
            refined_topics.push(topic.clone());
            units.push((topic.clone(), data));
        }
        let step2 = ChunkedDocumentProcessor::new(ctx, StageId::V, model2, format!("b{bc}_stage_v_step2"));
        let parts = step2.topic_parts(prompt2, units);
        let outcome2 = step2.process(parts).await?;
        outcome2.require_any(StageId::V)?;
        let step2_questions: Vec<Record> = questions_by_topic(&outcome2, &refined_topics)
            .into_values()
            .flatten()
            .map(|mut q| {
                q.remove("QId");
                q
            })
            .collect();
        info!("Stage V step 2: {} question(s)", step2_questions.len());

        let mut failures = outcome1.failures;
        failures.extend(outcome2.failures);

        // ── Step 3 ──
        let mut step3_questions = Vec::new();
        if let Some((prompt3, model3)) = config.prompt(PromptKey::StageVStep3).filter(|(p, _)| !p.trim().is_empty()) {
            ctx.pace().await?;
            let sample: Vec<Record> = records.iter().take(STEP3_SAMPLE).cloned().collect();
            let prompt = format!(
                "{}{}",
                prompts::fill_template(prompt3, &config.chapter_name, None),
                prompts::section(
                    "STAGE J DATA (FIRST 10 RECORDS, FOR PointId REFERENCE)",
                    &to_pretty(&project(&sample, &columns))?
                )
            );
            let stem = format!("b{bc}_stage_v_step3");
            match single_call_json(ctx, StageId::V, &prompt, None, model3, &stem).await {
                Ok(value) => step3_questions = reply_records(&value),
                Err(e) if is_unit_recoverable(&e) => {
                    warn!("Stage V step 3 failed, keeping steps 1 and 2: {}", e);
                    failures.push(UnitError::LlmFailed {
                        unit: "step 3".into(),
                        detail: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        ctx.phase(StageId::V, StagePhase::Merging);
        let mut questions = merge_by_test_id(&[&step1_questions, &step2_questions, &step3_questions]);
        renumber(&mut questions, &bc);
        info!("Stage V: {} question(s) after merge", questions.len());

        let path = StageId::V.output_path(config);
        let artifact = StageArtifact::new("V", questions)
            .with_meta("book_chapter", bc.clone())
            .with_meta("chapter", config.chapter_name.clone())
            .with_meta("model_step1", model1)
            .with_meta("model_step2", model2)
            .with_meta("total_topics", groups.len())
            .with_meta("total_questions_step1", step1_questions.len())
            .with_meta("total_questions_step2", step2_questions.len())
            .with_meta("total_questions_step3", step3_questions.len());
        persist(ctx, StageId::V, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()).with_failures(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recs(values: &[Value]) -> Vec<Record> {
        values.iter().map(|v| v.as_object().unwrap().clone()).collect()
    }

    #[test]
    fn topics_are_case_folded_and_sorted() {
        let groups = group_by_topic(&recs(&[
            json!({"topic": "Nucleus "}),
            json!({"topic": "membrane"}),
            json!({"topic": ""}),
            json!({"topic": "nucleus"}),
        ]));
        let keys: Vec<&str> = groups.keys().map(String::as_str).collect();
        assert_eq!(keys, ["default", "membrane", "nucleus"]);
        assert_eq!(groups["nucleus"].len(), 2);
    }

    #[test]
    fn later_steps_override_by_test_id() {
        let s1 = recs(&[json!({"TestID": 1, "q": "a1"}), json!({"TestID": 2, "q": "b1"})]);
        let s2 = recs(&[json!({"TestID": "2", "q": "b2"}), json!({"q": "loose"})]);
        let s3 = recs(&[json!({"TestID": 1, "q": "a3"}), json!({"TestID": 7, "q": "c3"})]);
        let merged = merge_by_test_id(&[&s1, &s2, &s3]);
        let texts: Vec<&str> = merged.iter().map(|q| q["q"].as_str().unwrap()).collect();
        assert_eq!(texts, ["a3", "b2", "loose", "c3"]);
    }

    #[test]
    fn renumbering_assigns_qids() {
        let mut qs = recs(&[json!({"TestID": 9}), json!({"TestID": 4, "QId": "x"})]);
        renumber(&mut qs, "105003");
        assert_eq!(qs[0]["TestID"], json!(1));
        assert_eq!(qs[0]["QId"], json!("1050030001"));
        assert_eq!(qs[1]["TestID"], json!(2));
        assert_eq!(qs[1]["QId"], json!("1050030002"));
    }
}

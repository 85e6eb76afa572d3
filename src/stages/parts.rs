//! Stage 2: post-process stage-1 rows one `Part` at a time.

use super::{load_nonempty, persist, to_pretty, StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{self, value_to_string, Record, StageArtifact};
use crate::chunked::{merge_rows, ChunkedDocumentProcessor, Part};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

pub struct PartsStage;

/// The integer `Part` of a row; missing or unparseable is 0.
pub fn part_number(record: &Record) -> i64 {
    record
        .get("Part")
        .map(value_to_string)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|f| f as i64)
        .unwrap_or(0)
}

/// Rows grouped by part number, ascending, each group in input order.
pub fn group_by_part(rows: &[Record]) -> BTreeMap<i64, Vec<Record>> {
    let mut groups: BTreeMap<i64, Vec<Record>> = BTreeMap::new();
    for row in rows {
        groups.entry(part_number(row)).or_default().push(row.clone());
    }
    groups
}

#[async_trait]
impl StageProcessor for PartsStage {
    fn id(&self) -> StageId {
        StageId::S2
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::S2, StagePhase::LoadingInputs);
        let (_, rows) = load_nonempty(StageId::S2, inputs.require(StageId::S2, StageId::S1)?).await?;
        let groups = group_by_part(&rows);

        ctx.phase(StageId::S2, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::Stage2, StageId::S2)?;
        let base = prompts::fill_template(template, &config.chapter_name, None);
        let mut parts = Vec::with_capacity(groups.len());
        let mut part_ids = Vec::with_capacity(groups.len());
        for (i, (part, group)) in groups.iter().enumerate() {
            let prompt = format!(
                "{base}{}{}",
                prompts::section(&format!("PART {part} ROWS (JSON)"), &to_pretty(group)?),
                prompts::part_rows_instruction(*part)
            );
            parts.push(Part::text(i + 1, format!("Part {part}"), prompt));
            part_ids.push(*part);
        }

        let stem = format!("s2_{}", config.book_chapter());
        let outcome = ChunkedDocumentProcessor::new(ctx, StageId::S2, model, &stem)
            .process(parts)
            .await?;
        outcome.require_any(StageId::S2)?;

        ctx.phase(StageId::S2, StagePhase::Merging);
        let per_part: Vec<Vec<Record>> = outcome
            .values
            .iter()
            .map(|(index, value)| {
                let part = part_ids[index - 1];
                super::reply_records(value)
                    .into_iter()
                    .map(|mut r| {
                        if r.get("Part").map_or(true, Value::is_null) {
                            r.insert("Part".into(), Value::from(part));
                        }
                        r
                    })
                    .collect()
            })
            .collect();
        let merged = merge_rows(per_part, None, config.drop_overlapping_rows);

        let json_path = StageId::S2.output_path(config);
        let csv_path = json_path.with_extension("csv");
        let artifact = StageArtifact::new("2", merged)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("total_parts", outcome.total)
            .with_meta("failed_parts", outcome.failures.len());
        persist(ctx, StageId::S2, &json_path, &artifact).await?;

        let mut result = StageOutcome::new(json_path, artifact.data.len())
            .with_failures(outcome.failures);
        if artifact::write_csv(&csv_path, &artifact.data).await? {
            result = result.with_extra(csv_path);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn grouping_is_ordered_and_defaults_to_zero() {
        let rows = vec![
            rec(json!({"Part": 2, "t": "a"})),
            rec(json!({"t": "b"})),
            rec(json!({"Part": "1", "t": "c"})),
            rec(json!({"Part": 2, "t": "d"})),
        ];
        let groups = group_by_part(&rows);
        let keys: Vec<i64> = groups.keys().copied().collect();
        assert_eq!(keys, vec![0, 1, 2]);
        assert_eq!(groups[&2].len(), 2);
        assert_eq!(groups[&2][1]["t"], json!("d"));
    }

    #[test]
    fn part_number_parsing() {
        assert_eq!(part_number(&rec(json!({"Part": "3"}))), 3);
        assert_eq!(part_number(&rec(json!({"Part": 4.0}))), 4);
        assert_eq!(part_number(&rec(json!({"Part": "x"}))), 0);
    }
}

//! Stages 3 and 4: chapter structure, then the flat point list.
//!
//! Both stages run in continuation mode because a whole chapter's structure
//! rarely fits in one reply. Stage 3 returns structure items; Stage 4 turns
//! them into a hierarchy of up to five levels whose leaves carry `points`
//! lists. That hierarchy is kept verbatim in `s4_{BBBCCC}_raw.json` and
//! flattened into one record per point.

use super::{load_nonempty, persist, to_pretty, StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{self, Record, StageArtifact};
use crate::chunked::{ChunkedDocumentProcessor, EnvelopeOutcome};
use crate::config::PromptKey;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::point_id::PointId;
use crate::progress::StagePhase;
use crate::prompts;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

pub struct StructureStage;
pub struct PointsStage;

fn require_content(stage: StageId, outcome: &EnvelopeOutcome) -> Result<(), PipelineError> {
    if outcome.content.is_empty() {
        return Err(PipelineError::NoUsableOutput {
            stage: stage.to_string(),
            total: outcome.chunks.max(1),
            first_error: outcome
                .failures
                .first()
                .map(ToString::to_string)
                .unwrap_or_else(|| "model returned no content".into()),
        });
    }
    Ok(())
}

#[async_trait]
impl StageProcessor for StructureStage {
    fn id(&self) -> StageId {
        StageId::S3
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::S3, StagePhase::LoadingInputs);
        let (_, rows) = load_nonempty(StageId::S3, inputs.require(StageId::S3, StageId::S2)?).await?;

        ctx.phase(StageId::S3, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::Stage3, StageId::S3)?;
        let prompt = prompts::fill_template(template, &config.chapter_name, None);
        let data = prompts::section("STAGE 2 ROWS (JSON)", &to_pretty(&rows)?);

        let stem = format!("s3_{}", config.book_chapter());
        let outcome = ChunkedDocumentProcessor::new(ctx, StageId::S3, model, &stem)
            .process_envelope(&prompt, &data)
            .await?;
        require_content(StageId::S3, &outcome)?;

        ctx.phase(StageId::S3, StagePhase::Merging);
        let items: Vec<Record> = outcome
            .content
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        if items.len() < outcome.content.len() {
            warn!(
                "Stage 3: dropped {} non-object item(s)",
                outcome.content.len() - items.len()
            );
        }

        let path = StageId::S3.output_path(config);
        let artifact = StageArtifact::new("3", items)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("chapter", outcome.chapter.clone().unwrap_or_else(|| config.chapter_name.clone()))
            .with_meta("chunks", outcome.chunks)
            .with_meta("completed", outcome.completed);
        persist(ctx, StageId::S3, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len()).with_failures(outcome.failures))
    }
}

#[async_trait]
impl StageProcessor for PointsStage {
    fn id(&self) -> StageId {
        StageId::S4
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        let config = &ctx.config;
        ctx.phase(StageId::S4, StagePhase::LoadingInputs);
        let (upstream, items) = load_nonempty(StageId::S4, inputs.require(StageId::S4, StageId::S3)?).await?;

        ctx.phase(StageId::S4, StagePhase::BuildingPrompt);
        let (template, model) = config.require_prompt(PromptKey::Stage4, StageId::S4)?;
        let prompt = prompts::fill_template(template, &config.chapter_name, None);
        let data = prompts::section("STAGE 3 STRUCTURE (JSON)", &to_pretty(&items)?);

        let stem = format!("s4_{}", config.book_chapter());
        let outcome = ChunkedDocumentProcessor::new(ctx, StageId::S4, model, &stem)
            .process_envelope(&prompt, &data)
            .await?;
        require_content(StageId::S4, &outcome)?;

        ctx.phase(StageId::S4, StagePhase::Merging);
        let chapter = outcome
            .chapter
            .clone()
            .or_else(|| upstream.meta_str("chapter").map(str::to_string))
            .unwrap_or_else(|| config.chapter_name.clone());
        let hierarchy = json!({"chapter": chapter, "content": outcome.content});
        let raw_path = config
            .output_dir
            .join(format!("s4_{}_raw.json", config.book_chapter()));
        artifact::write_json(&raw_path, &hierarchy).await?;

        let records = flatten_hierarchy(&hierarchy, config.start_point_id)?;
        if records.is_empty() {
            return Err(PipelineError::NoUsableOutput {
                stage: StageId::S4.to_string(),
                total: outcome.chunks,
                first_error: format!("no points in hierarchy (kept in {})", raw_path.display()),
            });
        }
        let last_id = records
            .last()
            .and_then(|r| r.get("PointId"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        info!(
            "Stage 4: {} points, PointIds {} to {}",
            records.len(),
            config.start_point_id,
            last_id
        );

        let path = StageId::S4.output_path(config);
        let artifact = StageArtifact::new("4", records)
            .with_meta("model", model)
            .with_meta("book_chapter", config.book_chapter())
            .with_meta("chapter", chapter)
            .with_meta("start_point_id", config.start_point_id.to_string())
            .with_meta("chunks", outcome.chunks)
            .with_meta("completed", outcome.completed);
        persist(ctx, StageId::S4, &path, &artifact).await?;
        Ok(StageOutcome::new(path, artifact.data.len())
            .with_extra(raw_path)
            .with_failures(outcome.failures))
    }
}

// ── Flattening ───────────────────────────────────────────────────────────

const LEVEL_KEYS: [(&str, &str); 5] = [
    ("level_1", "فصل"),
    ("level_2", "زیرفصل"),
    ("level_3", "مبحث"),
    ("level_4", "عنوان"),
    ("level_5", "زیرعنوان"),
];

const LABEL_PREFIXES: [&str; 5] = ["فصل:", "زیرفصل:", "مبحث:", "عنوان:", "زیرعنوان:"];

/// Strip a leading level marker such as `مبحث:` and surrounding space.
pub fn clean_label(text: &str) -> String {
    LABEL_PREFIXES
        .iter()
        .find_map(|p| text.strip_prefix(p))
        .unwrap_or(text)
        .trim()
        .to_string()
}

fn non_empty_str<'v>(node: &'v serde_json::Map<String, Value>, key: &str) -> Option<&'v str> {
    node.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn walk(node: &Value, inherited: &[String; 5], chapter: &str, out: &mut Vec<Record>) {
    let Some(node) = node.as_object() else {
        return;
    };
    let mut labels = inherited.clone();
    for (slot, (latin, local)) in labels.iter_mut().zip(LEVEL_KEYS) {
        if let Some(v) = non_empty_str(node, latin).or_else(|| non_empty_str(node, local)) {
            *slot = v.to_string();
        }
        *slot = clean_label(slot);
    }

    if let Some(Value::Array(points)) = node.get("points") {
        for point in points.iter().filter_map(Value::as_str) {
            let text = point.trim().trim_start_matches('•').trim();
            if text.is_empty() {
                continue;
            }
            let mut row = Record::new();
            row.insert("chapter".into(), Value::from(chapter));
            row.insert("subchapter".into(), Value::from(labels[1].as_str()));
            row.insert("topic".into(), Value::from(labels[2].as_str()));
            row.insert("subtopic".into(), Value::from(labels[3].as_str()));
            row.insert("subsubtopic".into(), Value::from(labels[4].as_str()));
            row.insert("Points".into(), Value::from(text));
            out.push(row);
        }
    }
    if let Some(Value::Array(children)) = node.get("children") {
        for child in children {
            walk(child, &labels, chapter, out);
        }
    }
}

/// One record per point of a `{chapter, content}` hierarchy, in reading order.
///
/// The root may also use `فصل`/`children`. Labels missing on a node are
/// inherited from its parent. `chapter` always comes from the root.
pub fn flatten_points(root: &Value) -> Vec<Record> {
    let chapter = root
        .get("chapter")
        .or_else(|| root.get("فصل"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let content = match root.get("content").filter(|c| !is_empty_value(c)) {
        Some(c) => c,
        None => root.get("children").unwrap_or(&Value::Null),
    };
    let items: Vec<&Value> = match content {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        single => vec![single],
    };

    let mut out = Vec::new();
    let top = <[String; 5]>::default();
    for item in items {
        walk(item, &top, chapter, &mut out);
    }
    out
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// [`flatten_points`] with PointIds allocated consecutively from `start`.
pub fn flatten_hierarchy(root: &Value, start: PointId) -> Result<Vec<Record>, PipelineError> {
    flatten_points(root)
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            let mut out = Record::with_capacity(row.len() + 1);
            out.insert("PointId".into(), Value::String(start.advance(i)?.to_string()));
            out.extend(row);
            Ok(out)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> Value {
        json!({
            "chapter": "Cells",
            "content": [
                {
                    "level_2": "زیرفصل: Structure",
                    "children": [
                        {
                            "مبحث": "Membrane",
                            "points": ["• lipid bilayer", "", "  • proteins"]
                        },
                        {
                            "level_3": "Nucleus",
                            "children": [
                                {"level_4": "Envelope", "points": ["double membrane"]}
                            ]
                        }
                    ]
                },
                "not an object"
            ]
        })
    }

    #[test]
    fn labels_inherit_and_bullets_are_stripped() {
        let rows = flatten_points(&hierarchy());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["subchapter"], json!("Structure"));
        assert_eq!(rows[0]["topic"], json!("Membrane"));
        assert_eq!(rows[0]["Points"], json!("lipid bilayer"));
        assert_eq!(rows[1]["Points"], json!("proteins"));
        assert_eq!(rows[2]["topic"], json!("Nucleus"));
        assert_eq!(rows[2]["subtopic"], json!("Envelope"));
        assert_eq!(rows[2]["subsubtopic"], json!(""));
        assert!(rows.iter().all(|r| r["chapter"] == json!("Cells")));
    }

    #[test]
    fn point_ids_are_consecutive_and_lead_the_row() {
        let start: PointId = "1050030001".parse().unwrap();
        let rows = flatten_hierarchy(&hierarchy(), start).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r["PointId"].as_str().unwrap()).collect();
        assert_eq!(ids, ["1050030001", "1050030002", "1050030003"]);
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["PointId", "chapter", "subchapter", "topic", "subtopic", "subsubtopic", "Points"]
        );
    }

    #[test]
    fn localized_root_is_accepted() {
        let root = json!({"فصل": "پوست", "children": [{"عنوان": "عنوان: لایه‌ها", "points": ["اپیدرم"]}]});
        let rows = flatten_points(&root);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["chapter"], json!("پوست"));
        assert_eq!(rows[0]["subtopic"], json!("لایه‌ها"));
    }

    #[test]
    fn sequence_overflow_is_reported() {
        let start = PointId::new(105, 3, 9999);
        assert!(flatten_hierarchy(&hierarchy(), start).is_err());
    }

    #[test]
    fn label_prefixes() {
        assert_eq!(clean_label("مبحث: غشا "), "غشا");
        assert_eq!(clean_label("  plain "), "plain");
    }
}

//! Stage F: the image catalog. No model call.
//!
//! Every image-note point from Stage E gets a catalog row whose
//! `file_name` is the canonical ASCII token of its image reference
//! (`تصویر 30:19` → `Fig30_19`). Descriptions come, in order, from the
//! captions kept in the `_filepic` file.

use super::image_notes::filepic_path;
use super::{load_nonempty, load_records, persist, StageId, StageInputs, StageOutcome, StageProcessor};
use crate::artifact::{field_str, Record, StageArtifact};
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::progress::StagePhase;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

pub struct ImageCatalogStage;

/// Figure or table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Figure,
    Table,
}

impl ImageKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ImageKind::Figure => "Fig",
            ImageKind::Table => "Table",
        }
    }

    /// The catalog's numeric image type.
    pub fn code(self) -> u8 {
        match self {
            ImageKind::Figure => 2,
            ImageKind::Table => 3,
        }
    }
}

static RE_FIG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)fig(?:ure)?\.?\s*").unwrap());
static RE_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)table\s*").unwrap());
static RE_NOT_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9_]").unwrap());

const FIGURE_LOCAL: &str = "تصویر";
const TABLE_LOCAL: &str = "جدول";

/// Map Extended Arabic-Indic and Arabic-Indic digits to ASCII.
fn ascii_digits(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            _ => c,
        })
        .collect()
}

/// Detect the marker and return the reference with it removed.
fn split_marker(reference: &str) -> (ImageKind, String) {
    if reference.contains(FIGURE_LOCAL) {
        (ImageKind::Figure, reference.replace(FIGURE_LOCAL, ""))
    } else if reference.contains(TABLE_LOCAL) {
        (ImageKind::Table, reference.replace(TABLE_LOCAL, ""))
    } else if RE_FIG.is_match(reference) {
        (ImageKind::Figure, RE_FIG.replace_all(reference, "").into_owned())
    } else if RE_TABLE.is_match(reference) {
        (ImageKind::Table, RE_TABLE.replace_all(reference, "").into_owned())
    } else {
        (ImageKind::Figure, reference.to_string())
    }
}

/// Canonical file token for an image reference.
///
/// The figure/table marker may be Latin or Persian; without one the
/// reference is taken as a figure. `:` becomes `_` and every other
/// character that is not a digit or `_` is dropped.
pub fn canonicalize(reference: &str) -> (ImageKind, String) {
    let (kind, rest) = split_marker(reference.trim());
    let rest = ascii_digits(&rest).replace(':', "_");
    let token = RE_NOT_TOKEN.replace_all(&rest, "");
    (kind, format!("{}{}", kind.prefix(), token))
}

/// One catalog row.
pub fn catalog_row(point_id: &str, reference: &str, description: &str) -> Record {
    let (kind, file_name) = canonicalize(reference);
    let mut row = Record::new();
    row.insert("PointId".into(), Value::from(point_id));
    row.insert("file_name".into(), Value::from(file_name));
    row.insert("image_type".into(), Value::from(kind.code()));
    row.insert("display_level".into(), Value::from("6"));
    row.insert("description".into(), Value::from(description));
    row.insert("question".into(), Value::from(""));
    row.insert("is_title".into(), Value::from(""));
    row
}

/// The image-note records at the tail of a Stage E artifact.
fn image_notes<'r>(meta: &serde_json::Map<String, Value>, records: &'r [Record]) -> Option<&'r [Record]> {
    if let Some(first) = meta.get("first_image_point_id").and_then(Value::as_str) {
        let start = records.iter().position(|r| field_str(r, "PointId") == first)?;
        return Some(&records[start..]);
    }
    let count = meta.get("image_notes_count").and_then(Value::as_u64)? as usize;
    records.len().checked_sub(count).map(|start| &records[start..])
}

#[async_trait]
impl StageProcessor for ImageCatalogStage {
    fn id(&self) -> StageId {
        StageId::F
    }

    async fn run(&self, ctx: &PipelineContext, inputs: &StageInputs) -> Result<StageOutcome, PipelineError> {
        ctx.phase(StageId::F, StagePhase::LoadingInputs);
        let e_path = inputs.require(StageId::F, StageId::E)?;
        let (artifact, records) = load_nonempty(StageId::F, e_path).await?;
        let notes = image_notes(&artifact.metadata, &records).ok_or_else(|| {
            PipelineError::missing(
                StageId::F,
                format!("{} does not say where its image notes start", e_path.display()),
            )
        })?;

        let filepic = filepic_path(e_path);
        let descriptions: Vec<String> = match load_records(&filepic).await {
            Ok((_, rows)) => rows
                .iter()
                .map(|r| {
                    ["caption", "Caption", "CAPTION"]
                        .iter()
                        .map(|k| field_str(r, k))
                        .find(|s| !s.is_empty())
                        .unwrap_or_default()
                })
                .collect(),
            Err(e) => {
                warn!("Stage F: no captions from {}: {}", filepic.display(), e);
                Vec::new()
            }
        };

        ctx.phase(StageId::F, StagePhase::Merging);
        let rows: Vec<Record> = notes
            .iter()
            .enumerate()
            .map(|(i, note)| {
                let description = descriptions.get(i).map(String::as_str).unwrap_or_default();
                catalog_row(&field_str(note, "PointId"), &field_str(note, "Points"), description)
            })
            .collect();
        info!("Stage F: {} catalog rows", rows.len());

        let path = StageId::F.output_path(&ctx.config);
        let out = StageArtifact::new("F", rows)
            .with_meta("book_chapter", ctx.config.book_chapter())
            .with_meta("source_stage_e", e_path.display().to_string())
            .with_meta("captions_found", descriptions.iter().filter(|d| !d.is_empty()).count());
        persist(ctx, StageId::F, &path, &out).await?;
        Ok(StageOutcome::new(path, out.data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_tokens() {
        assert_eq!(canonicalize("تصویر 30:19").1, "Fig30_19");
        assert_eq!(canonicalize("تصویر e30:18").1, "Fig30_18");
        assert_eq!(canonicalize("Table 5:2"), (ImageKind::Table, "Table5_2".into()));
        assert_eq!(canonicalize("جدول 30:3").1, "Table30_3");
        assert_eq!(canonicalize("Figure 2:1").1, "Fig2_1");
        assert_eq!(canonicalize("30:1").1, "Fig30_1");
        assert_eq!(canonicalize("تصویر ۳۰:۱۹").1, "Fig30_19");
    }

    #[test]
    fn localized_table_token_is_digits_and_underscores() {
        let (kind, token) = canonicalize("جدول e30:18");
        assert_eq!(kind, ImageKind::Table);
        let rest = token.strip_prefix("Table").unwrap();
        assert!(rest.chars().all(|c| c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn row_shape() {
        let row = catalog_row("1050030042", "جدول 1:2", "Stages");
        assert_eq!(
            Value::Object(row),
            json!({
                "PointId": "1050030042",
                "file_name": "Table1_2",
                "image_type": 3,
                "display_level": "6",
                "description": "Stages",
                "question": "",
                "is_title": ""
            })
        );
    }

    #[test]
    fn notes_located_by_metadata() {
        let records: Vec<Record> = (1..=4)
            .map(|i| json!({"PointId": format!("105003000{i}")}).as_object().unwrap().clone())
            .collect();
        let meta = json!({"first_image_point_id": "1050030003"}).as_object().unwrap().clone();
        assert_eq!(image_notes(&meta, &records).unwrap().len(), 2);
        let meta = json!({"image_notes_count": 1}).as_object().unwrap().clone();
        assert_eq!(image_notes(&meta, &records).unwrap().len(), 1);
        assert!(image_notes(&serde_json::Map::new(), &records).is_none());
    }
}

//! Split work that is too large for one model call into parts.
//!
//! ## Two shapes of chunking
//!
//! * **Independent parts** ([`ChunkedDocumentProcessor::process`]): the
//!   caller decides the split up front, by page halves
//!   ([`ChunkedDocumentProcessor::page_halves`]), by topic
//!   ([`ChunkedDocumentProcessor::topic_parts`]) or by record batches. Parts
//!   run one at a time with a pacing pause between them; a failed part is
//!   recorded and skipped.
//! * **Continuation envelopes** ([`ChunkedDocumentProcessor::process_envelope`]):
//!   the model decides where each chunk ends and hands back an opaque
//!   cursor. The loop stops on `is_last` or at `max_chunks`.
//!
//! Each raw reply is written to a companion `.txt` file before any JSON is
//! extracted from it. That file is the resume anchor: a crash after the
//! write loses no paid-for model output.

use crate::artifact::{self, field_str, Record};
use crate::context::PipelineContext;
use crate::error::{PipelineError, UnitError};
use crate::progress::StagePhase;
use crate::prompts;
use crate::stages::{extract_or_reload, is_unit_recoverable, reply_records, StageId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a part reaches the model.
#[derive(Debug, Clone, PartialEq)]
pub enum PartInput {
    /// Attach the document (or its text, for providers without attachments).
    Document(PathBuf),
    /// The prompt already carries everything.
    Text,
}

/// One bounded unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// 1-based, ascending in processing order.
    pub index: usize,
    pub label: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub input: PartInput,
}

impl Part {
    pub fn text(index: usize, label: impl Into<String>, prompt: String) -> Self {
        Self {
            index,
            label: label.into(),
            prompt,
            system_prompt: None,
            input: PartInput::Text,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Whether page-half parts attach the PDF or inline its extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Attach,
    ExtractText,
}

/// Inclusive 1-based page ranges for a two-way split at the midpoint.
pub fn split_halves(total_pages: usize) -> Vec<(usize, usize)> {
    match total_pages {
        0 => Vec::new(),
        1 => vec![(1, 1)],
        n => {
            let mid = n / 2;
            vec![(1, mid), (mid + 1, n)]
        }
    }
}

/// Result of running independent parts.
#[derive(Debug, Default)]
pub struct PartsOutcome {
    /// Extracted JSON per successful part, in part order.
    pub values: Vec<(usize, Value)>,
    pub failures: Vec<UnitError>,
    pub total: usize,
}

impl PartsOutcome {
    /// Records of every successful part, concatenated in part order.
    pub fn records(&self) -> Vec<Vec<Record>> {
        self.values.iter().map(|(_, v)| reply_records(v)).collect()
    }

    /// Fail the stage when no part produced usable data.
    pub fn require_any(&self, stage: StageId) -> Result<(), PipelineError> {
        if self.values.is_empty() {
            return Err(PipelineError::NoUsableOutput {
                stage: stage.to_string(),
                total: self.total,
                first_error: self
                    .failures
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no parts to process".into()),
            });
        }
        Ok(())
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────

/// One reply in continuation mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEnvelope {
    pub chunk_index: usize,
    pub is_last: bool,
    pub items: Vec<Value>,
    pub next_cursor: Option<Value>,
    pub chapter: Option<String>,
}

impl ChunkEnvelope {
    /// Read an envelope from an extracted reply.
    ///
    /// A bare array is taken as a final chunk whose items are the array.
    /// An object without `payload` is not an envelope.
    pub fn from_value(value: Value, requested: usize) -> Option<Self> {
        let mut map = match value {
            Value::Array(items) => {
                return Some(Self {
                    chunk_index: requested,
                    is_last: true,
                    items,
                    next_cursor: None,
                    chapter: None,
                })
            }
            Value::Object(map) => map,
            _ => return None,
        };
        let payload = map.remove("payload")?;
        let chunk_index = map
            .get("chunk_index")
            .and_then(|v| {
                v.as_u64()
                    .map(|n| n as usize)
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .unwrap_or(requested);
        let is_last = match map.get("is_last") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        let next_cursor = map.remove("next_cursor").filter(Value::is_object);

        let mut chapter = None;
        let items = match payload {
            Value::Array(items) => items,
            Value::Object(mut p) => {
                chapter = p
                    .get("chapter")
                    .or_else(|| p.get("فصل"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match p.remove("content") {
                    Some(Value::Array(items)) => items,
                    Some(Value::Null) | None => Vec::new(),
                    Some(single) => vec![single],
                }
            }
            _ => Vec::new(),
        };
        Some(Self {
            chunk_index,
            is_last,
            items,
            next_cursor,
            chapter,
        })
    }
}

/// Result of a continuation loop.
#[derive(Debug, Default)]
pub struct EnvelopeOutcome {
    /// Payload items of every chunk, in order.
    pub content: Vec<Value>,
    pub chunks: usize,
    /// `true` when the model signalled `is_last`.
    pub completed: bool,
    pub chapter: Option<String>,
    pub failures: Vec<UnitError>,
}

// ── Processor ────────────────────────────────────────────────────────────

/// Runs parts for one stage against one model.
pub struct ChunkedDocumentProcessor<'a> {
    ctx: &'a PipelineContext,
    stage: StageId,
    model: String,
    raw_stem: String,
}

impl<'a> ChunkedDocumentProcessor<'a> {
    /// `raw_stem` names the companion files: `{raw_stem}_part{n}.txt`.
    pub fn new(ctx: &'a PipelineContext, stage: StageId, model: impl Into<String>, raw_stem: impl Into<String>) -> Self {
        Self {
            ctx,
            stage,
            model: model.into(),
            raw_stem: raw_stem.into(),
        }
    }

    fn raw_path(&self, kind: &str, index: usize) -> PathBuf {
        self.ctx
            .output_dir()
            .join(format!("{}_{kind}{index}.txt", self.raw_stem))
    }

    /// Two parts split at the page midpoint, each constrained to its range.
    pub async fn page_halves(&self, doc: &Path, base_prompt: &str, source: PageSource) -> Result<Vec<Part>, PipelineError> {
        let total = self.ctx.documents.count_pages(doc).await?;
        let ranges = split_halves(total);
        if ranges.is_empty() {
            return Err(PipelineError::missing(
                self.stage,
                format!("{} has no pages", doc.display()),
            ));
        }
        info!(
            "Stage {}: {} pages split into {} part(s)",
            self.stage,
            total,
            ranges.len()
        );
        let mut parts = Vec::with_capacity(ranges.len());
        for (i, (start, end)) in ranges.into_iter().enumerate() {
            let mut prompt = format!("{base_prompt}{}", prompts::page_range_suffix(start, end));
            let input = match source {
                PageSource::Attach => PartInput::Document(doc.to_path_buf()),
                PageSource::ExtractText => {
                    let text = self.ctx.documents.extract_text_range(doc, start, end).await?;
                    prompt.push_str(&prompts::section(&format!("PAGES {start}-{end}"), &text));
                    PartInput::Text
                }
            };
            parts.push(Part {
                index: i + 1,
                label: format!("pages {start}-{end}"),
                prompt,
                system_prompt: None,
                input,
            });
        }
        Ok(parts)
    }

    /// One part per `(topic, data)` unit, in the given order.
    pub fn topic_parts(&self, base_prompt: &str, units: Vec<(String, String)>) -> Vec<Part> {
        units
            .into_iter()
            .enumerate()
            .map(|(i, (topic, data))| {
                let prompt = format!(
                    "{}{}{}",
                    prompts::fill_template(base_prompt, &self.ctx.config.chapter_name, Some(&topic)),
                    prompts::topic_suffix(&topic),
                    data
                );
                Part::text(i + 1, format!("topic '{topic}'"), prompt)
            })
            .collect()
    }

    async fn call(&self, part: &Part) -> Result<String, PipelineError> {
        let options = self.ctx.call_options();
        match &part.input {
            PartInput::Document(path) => {
                self.ctx
                    .client
                    .process_document_with_prompt(path, &part.prompt, &self.model, options)
                    .await
            }
            PartInput::Text => {
                self.ctx
                    .client
                    .process_text(&part.prompt, part.system_prompt.as_deref(), &self.model, options)
                    .await
            }
        }
    }

    /// Run `parts` sequentially. Only cancellation and configuration errors
    /// abort; anything else fails the part and moves on.
    pub async fn process(&self, parts: Vec<Part>) -> Result<PartsOutcome, PipelineError> {
        let total = parts.len();
        let mut outcome = PartsOutcome {
            total,
            ..PartsOutcome::default()
        };
        let progress = &self.ctx.progress;

        for (n, part) in parts.iter().enumerate() {
            self.ctx.cancel.check()?;
            if n > 0 {
                self.ctx.pace().await?;
            }
            info!(
                "Stage {}: part {}/{} ({})",
                self.stage, part.index, total, part.label
            );
            self.ctx.phase(self.stage, StagePhase::InvokingModel);
            let reply = match self.call(part).await {
                Ok(reply) => reply,
                Err(e) if is_unit_recoverable(&e) => {
                    warn!("Stage {}: {} failed: {}", self.stage, part.label, e);
                    let err = UnitError::LlmFailed {
                        unit: part.label.clone(),
                        detail: e.to_string(),
                    };
                    progress.on_unit_error(self.stage, part.index, total, &err.to_string());
                    outcome.failures.push(err);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let raw_path = self.raw_path("part", part.index);
            artifact::write_atomic(&raw_path, reply.as_bytes()).await?;
            debug!("Saved raw reply to {}", raw_path.display());

            self.ctx.phase(self.stage, StagePhase::ExtractingJson);
            match extract_or_reload(&reply, &raw_path) {
                Some(value) => {
                    progress.on_unit_complete(self.stage, part.index, total);
                    outcome.values.push((part.index, value));
                }
                None => {
                    warn!(
                        "Stage {}: no JSON in reply for {} (kept in {})",
                        self.stage,
                        part.label,
                        raw_path.display()
                    );
                    let err = UnitError::ExtractionFailed {
                        unit: part.label.clone(),
                        raw_path: raw_path.display().to_string(),
                    };
                    progress.on_unit_error(self.stage, part.index, total, &err.to_string());
                    outcome.failures.push(err);
                }
            }
        }

        if !outcome.failures.is_empty() {
            warn!(
                "Stage {}: {}/{} part(s) failed",
                self.stage,
                outcome.failures.len(),
                total
            );
        }
        Ok(outcome)
    }

    /// Continuation loop: ask for chunk after chunk until the model says
    /// `is_last` or `max_chunks` is reached.
    ///
    /// `chunk_index` only moves forward. A chunk that cannot be read ends the
    /// loop, keeping whatever earlier chunks returned.
    pub async fn process_envelope(&self, base_prompt: &str, inputs: &str) -> Result<EnvelopeOutcome, PipelineError> {
        let max_chunks = self.ctx.config.max_chunks;
        let progress = &self.ctx.progress;
        let mut outcome = EnvelopeOutcome::default();
        let mut chunk_index = 1usize;
        let mut cursor: Option<String> = None;

        while chunk_index <= max_chunks {
            self.ctx.cancel.check()?;
            if outcome.chunks > 0 {
                self.ctx.pace().await?;
            }
            info!("Stage {}: chunk {}", self.stage, chunk_index);
            let prompt = format!(
                "{base_prompt}{}{}",
                prompts::ENVELOPE_CONTRACT,
                prompts::envelope_request(inputs, chunk_index, cursor.as_deref())
            );
            let unit = format!("chunk {chunk_index}");

            self.ctx.phase(self.stage, StagePhase::InvokingModel);
            let reply = match self
                .ctx
                .client
                .process_text(&prompt, None, &self.model, self.ctx.call_options())
                .await
            {
                Ok(r) => r,
                Err(e) if is_unit_recoverable(&e) => {
                    warn!("Stage {}: {} failed: {}", self.stage, unit, e);
                    outcome.failures.push(UnitError::LlmFailed {
                        unit,
                        detail: e.to_string(),
                    });
                    break;
                }
                Err(e) => return Err(e),
            };
            outcome.chunks += 1;

            let raw_path = self.raw_path("chunk", chunk_index);
            artifact::write_atomic(&raw_path, reply.as_bytes()).await?;

            self.ctx.phase(self.stage, StagePhase::ExtractingJson);
            let envelope = extract_or_reload(&reply, &raw_path)
                .and_then(|v| ChunkEnvelope::from_value(v, chunk_index));
            let Some(envelope) = envelope else {
                warn!(
                    "Stage {}: {} is not a chunk envelope (kept in {})",
                    self.stage,
                    unit,
                    raw_path.display()
                );
                let err = UnitError::ExtractionFailed {
                    unit,
                    raw_path: raw_path.display().to_string(),
                };
                progress.on_unit_error(self.stage, chunk_index, max_chunks, &err.to_string());
                outcome.failures.push(err);
                break;
            };

            info!(
                "Stage {}: chunk {} added {} item(s)",
                self.stage,
                envelope.chunk_index,
                envelope.items.len()
            );
            progress.on_unit_complete(self.stage, chunk_index, max_chunks);
            if outcome.chapter.is_none() {
                outcome.chapter = envelope.chapter;
            }
            outcome.content.extend(envelope.items);
            if envelope.is_last {
                outcome.completed = true;
                break;
            }
            cursor = envelope
                .next_cursor
                .as_ref()
                .and_then(|c| serde_json::to_string_pretty(c).ok());
            chunk_index = envelope.chunk_index.max(chunk_index) + 1;
        }

        if !outcome.completed && chunk_index > max_chunks {
            warn!(
                "Stage {}: stopped after {} chunk(s) without is_last (limit {})",
                self.stage, outcome.chunks, max_chunks
            );
        }
        Ok(outcome)
    }
}

// ── Merging ──────────────────────────────────────────────────────────────

/// Serialise with object keys sorted at every level, for structural equality.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                Value::Object(
                    keys.into_iter()
                        .map(|k| (k.clone(), sorted(&map[k])))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Parse a `Number`-style sort key as a float.
///
/// Persian and Arabic-Indic digits are mapped to ASCII and a comma or
/// Arabic decimal separator is read as the decimal point. Anything
/// unparseable sorts as 0.
pub fn numeric_key(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let ascii: String = s
                .trim()
                .chars()
                .map(|c| match c {
                    '۰'..='۹' => char::from(b'0' + (c as u32 - '۰' as u32) as u8),
                    '٠'..='٩' => char::from(b'0' + (c as u32 - '٠' as u32) as u8),
                    ',' | '٫' => '.',
                    other => other,
                })
                .collect();
            ascii.parse().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

/// Column holding a row's transcribed text, compared by the overlap pass.
const OVERLAP_TEXT_KEY: &str = "Extraction";
/// Leading characters of the text that take part in the overlap key.
const OVERLAP_KEY_CHARS: usize = 200;
/// Leading characters compared position by position.
const SIMILARITY_WINDOW: usize = 500;

/// Concatenate part records in part order, drop structural duplicates
/// (ignoring the `Part` column) and stable-sort by `sort_key` when given.
///
/// With `near_duplicates`, a second pass drops rows that adjacent page
/// halves transcribed twice: rows with the same `Number`, `Type` and first
/// 200 characters of `Extraction`, where one text contains the other or
/// their texts are near the same length and agree on more than 80% of
/// leading positions.
pub fn merge_rows(parts: Vec<Vec<Record>>, sort_key: Option<&str>, near_duplicates: bool) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut by_overlap_key: HashMap<(String, String, String), usize> = HashMap::new();
    let mut rows: Vec<Record> = Vec::new();
    let mut duplicates = 0usize;
    let mut overlaps = 0usize;
    for record in parts.into_iter().flatten() {
        let mut key_view = record.clone();
        key_view.remove("Part");
        let hash = canonical_json(&Value::Object(key_view));
        if seen.contains(&hash) {
            duplicates += 1;
            continue;
        }
        let key = overlap_key(&record);
        if near_duplicates {
            if let Some(&earlier) = by_overlap_key.get(&key) {
                let text = field_str(&record, OVERLAP_TEXT_KEY);
                if texts_overlap(&text, &field_str(&rows[earlier], OVERLAP_TEXT_KEY)) {
                    overlaps += 1;
                    continue;
                }
            }
        }
        seen.insert(hash);
        by_overlap_key.insert(key, rows.len());
        rows.push(record);
    }
    if duplicates > 0 {
        debug!("Dropped {} duplicate row(s)", duplicates);
    }
    if overlaps > 0 {
        warn!("Dropped {} overlapping row(s) from adjacent parts", overlaps);
    }
    if let Some(key) = sort_key {
        rows.sort_by(|a, b| {
            let ka = a.get(key).map(numeric_key).unwrap_or(0.0);
            let kb = b.get(key).map(numeric_key).unwrap_or(0.0);
            ka.total_cmp(&kb)
        });
    }
    rows
}

fn overlap_key(record: &Record) -> (String, String, String) {
    let number = record.get("Number").map(Value::to_string).unwrap_or_default();
    let text: String = field_str(record, OVERLAP_TEXT_KEY)
        .chars()
        .take(OVERLAP_KEY_CHARS)
        .collect();
    (number, field_str(record, "Type"), text)
}

/// Whether two non-empty texts are the same transcription.
fn texts_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.contains(b) || b.contains(a) {
        return true;
    }
    let (len_a, len_b) = (a.chars().count(), b.chars().count());
    let longest = len_a.max(len_b);
    if (len_a.abs_diff(len_b) as f64) >= longest as f64 * 0.2 {
        return false;
    }
    let window = len_a.min(len_b).min(SIMILARITY_WINDOW);
    let same = a
        .chars()
        .zip(b.chars())
        .take(window)
        .filter(|(x, y)| x == y)
        .count();
    window > 0 && same as f64 / window as f64 > 0.8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn halves() {
        assert_eq!(split_halves(20), vec![(1, 10), (11, 20)]);
        assert_eq!(split_halves(7), vec![(1, 3), (4, 7)]);
        assert_eq!(split_halves(1), vec![(1, 1)]);
        assert!(split_halves(0).is_empty());
    }

    #[test]
    fn merge_dedups_and_sorts_numerically() {
        let merged = merge_rows(
            vec![
                vec![rec(json!({"Number": "2", "text": "b"}))],
                vec![
                    rec(json!({"Number": "1", "text": "a"})),
                    rec(json!({"text": "b", "Number": "2"})),
                ],
            ],
            Some("Number"),
            true,
        );
        assert_eq!(
            Value::Array(merged.into_iter().map(Value::Object).collect()),
            json!([{"Number": "1", "text": "a"}, {"Number": "2", "text": "b"}])
        );
    }

    #[test]
    fn numeric_key_reads_separators_and_digits() {
        assert_eq!(numeric_key(&json!("10")), 10.0);
        assert_eq!(numeric_key(&json!("2,5")), 2.5);
        assert_eq!(numeric_key(&json!("۱۲")), 12.0);
        assert_eq!(numeric_key(&json!(3.25)), 3.25);
        assert_eq!(numeric_key(&json!("n/a")), 0.0);
        let mut rows = vec![
            rec(json!({"Number": "10"})),
            rec(json!({"Number": "9"})),
            rec(json!({"Number": "9.5"})),
        ];
        rows = merge_rows(vec![rows], Some("Number"), true);
        let order: Vec<String> = rows.iter().map(|r| r["Number"].as_str().unwrap().to_string()).collect();
        assert_eq!(order, ["9", "9.5", "10"]);
    }

    #[test]
    fn dedup_ignores_part_column() {
        let merged = merge_rows(
            vec![
                vec![rec(json!({"Number": "1", "Part": 1}))],
                vec![rec(json!({"Number": "1", "Part": 2}))],
            ],
            None,
            true,
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn overlapping_transcriptions_collapse() {
        let head = "x".repeat(OVERLAP_KEY_CHARS);
        let short = format!("{head} membrane");
        let long = format!("{head} membrane and proteins");
        let parts = || {
            vec![
                vec![rec(json!({"Number": "4", "Type": "text", "Extraction": short, "Part": 1}))],
                vec![
                    rec(json!({"Number": "4", "Type": "text", "Extraction": long, "Part": 2})),
                    rec(json!({"Number": "4", "Type": "figure", "Extraction": long, "Part": 2})),
                ],
            ]
        };
        let merged = merge_rows(parts(), None, true);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["Extraction"], json!(short));
        assert_eq!(merged[1]["Type"], json!("figure"));

        assert_eq!(merge_rows(parts(), None, false).len(), 3);
    }

    #[test]
    fn similar_prefix_counts_as_overlap() {
        let a = "abcdefghij".repeat(30);
        let mut b = a.clone();
        b.replace_range(250..260, "0123456789");
        assert!(texts_overlap(&a, &b));
        assert!(!texts_overlap(&a, &"z".repeat(300)));
        assert!(!texts_overlap("", &a));
    }

    #[test]
    fn envelope_parsing() {
        let env = ChunkEnvelope::from_value(
            json!({
                "chunk_index": 2,
                "is_last": false,
                "payload": {"chapter": "Cells", "content": [{"level_1": "a"}]},
                "next_cursor": {"next_page": 4}
            }),
            2,
        )
        .unwrap();
        assert_eq!(env.chunk_index, 2);
        assert!(!env.is_last);
        assert_eq!(env.items.len(), 1);
        assert_eq!(env.chapter.as_deref(), Some("Cells"));
        assert_eq!(env.next_cursor, Some(json!({"next_page": 4})));

        let bare = ChunkEnvelope::from_value(json!([1, 2]), 5).unwrap();
        assert!(bare.is_last);
        assert_eq!(bare.chunk_index, 5);

        assert!(ChunkEnvelope::from_value(json!({"chunk_index": 1}), 1).is_none());
    }

    #[test]
    fn envelope_string_fields() {
        let env = ChunkEnvelope::from_value(
            json!({"chunk_index": "3", "is_last": "true", "payload": [{"x": 1}], "next_cursor": "ignored"}),
            1,
        )
        .unwrap();
        assert_eq!(env.chunk_index, 3);
        assert!(env.is_last);
        assert_eq!(env.next_cursor, None);
    }

    #[test]
    fn canonical_json_is_order_independent() {
        assert_eq!(
            canonical_json(&json!({"b": 1, "a": {"d": 2, "c": 3}})),
            canonical_json(&json!({"a": {"c": 3, "d": 2}, "b": 1}))
        );
    }
}

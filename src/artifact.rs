//! The `{metadata, data}` envelope every stage persists, plus the file I/O
//! around it.
//!
//! ## Why normalise on read?
//!
//! Artifacts written by older runs, or returned by a model that drifted from
//! its prompt, spell the same column several ways (`Topic`, `topic`,
//! `مبحث`). [`normalize_record`] maps every known alias to one canonical
//! key when an artifact is loaded, so stage code reads a single name and
//! never probes alternatives.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

/// One row of stage output: a `PointId` plus stage-dependent columns.
pub type Record = Map<String, Value>;

/// Byte-order mark prefixed to CSV companions so spreadsheet tools pick
/// UTF-8 for non-Latin text.
pub const UTF8_BOM: &str = "\u{feff}";

/// The persisted unit of every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageArtifact {
    pub metadata: Map<String, Value>,
    pub data: Vec<Record>,
}

impl StageArtifact {
    /// A fresh artifact stamped with `stage`, the current time and the record count.
    pub fn new(stage: impl Into<String>, data: Vec<Record>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("stage".into(), Value::String(stage.into()));
        metadata.insert(
            "processed_at".into(),
            Value::String(chrono::Local::now().to_rfc3339()),
        );
        metadata.insert("total_records".into(), Value::from(data.len()));
        Self { metadata, data }
    }

    /// Attach a provenance field to the metadata.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

// ── Canonical schema ─────────────────────────────────────────────────────

const ALIASES: &[(&str, &[&str])] = &[
    ("PointId", &["point_id", "pointId", "pointid", "Point ID", "Point_ID", "POINTID"]),
    ("chapter", &["Chapter", "فصل"]),
    ("subchapter", &["Subchapter", "SubChapter", "sub_chapter", "زیرفصل"]),
    ("topic", &["Topic", "مبحث"]),
    ("subtopic", &["Subtopic", "SubTopic", "sub_topic", "عنوان"]),
    ("subsubtopic", &["Subsubtopic", "SubSubTopic", "sub_sub_topic", "زیرعنوان"]),
    ("Points", &["points", "Point", "point", "point_text"]),
];

fn canonical_key(key: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&key))
        .map(|(canonical, _)| *canonical)
}

/// Rename aliased columns to their canonical key, keeping column order.
///
/// A numeric `PointId` is rewritten as its string form. When both an alias
/// and the canonical key are present, the canonical value wins.
pub fn normalize_record(record: Record) -> Record {
    let mut out = Map::with_capacity(record.len());
    let present: Vec<&str> = ALIASES
        .iter()
        .map(|(c, _)| *c)
        .filter(|c| record.contains_key(*c))
        .collect();

    for (key, value) in &record {
        match canonical_key(key) {
            Some(canonical) if present.contains(&canonical) => {}
            Some(canonical) if !out.contains_key(canonical) => {
                out.insert(canonical.to_string(), value.clone());
            }
            Some(_) => {}
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(Value::Number(n)) = out.get("PointId") {
        let s = n.to_string();
        out.insert("PointId".into(), Value::String(s));
    }
    out
}

/// Render a scalar as the string stored in output columns.
///
/// `null` becomes `""`; every other value is kept, so a numeric `0` is `"0"`.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// A column as a string, `""` when absent.
pub fn field_str(record: &Record, key: &str) -> String {
    record.get(key).map(value_to_string).unwrap_or_default()
}

/// Pull a list of records out of a loosely shaped JSON value.
///
/// Accepts a bare array, or an object whose `data`, `points`, `rows`,
/// `payload` or `content` member holds one (recursively), and finally the
/// first array-valued member. Non-object entries are dropped.
pub fn records_in(value: &Value) -> Option<Vec<Record>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect(),
        ),
        Value::Object(map) => {
            for key in ["data", "points", "rows", "payload", "content"] {
                if let Some(inner) = map.get(key) {
                    if let Some(records) = records_in(inner) {
                        return Some(records);
                    }
                }
            }
            map.values()
                .find(|v| v.is_array())
                .and_then(records_in)
        }
        _ => None,
    }
}

// ── Reading ──────────────────────────────────────────────────────────────

/// Read and parse a JSON file.
pub async fn read_json(path: &Path) -> Result<Value, PipelineError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PipelineError::malformed(path, e.to_string()),
    })?;
    serde_json::from_str(&text).map_err(|e| PipelineError::malformed(path, e.to_string()))
}

/// Load an upstream artifact, tolerating historical shapes.
///
/// `data`, `points` and `rows` are all accepted as the record list, as is a
/// bare top-level array. Every record passes through [`normalize_record`].
pub async fn read_artifact(path: &Path) -> Result<StageArtifact, PipelineError> {
    let value = read_json(path).await?;
    let artifact = artifact_from_value(value)
        .ok_or_else(|| PipelineError::malformed(path, "no data/points/rows list"))?;
    debug!(
        "Loaded {} records from {}",
        artifact.data.len(),
        path.display()
    );
    Ok(artifact)
}

/// Interpret an in-memory value as an artifact; `None` when no record list is found.
pub fn artifact_from_value(value: Value) -> Option<StageArtifact> {
    let (metadata, list) = match value {
        Value::Array(_) => (Map::new(), value),
        Value::Object(mut map) => {
            let metadata = match map.remove("metadata") {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            };
            let list = ["data", "points", "rows"]
                .iter()
                .find_map(|k| map.remove(*k).filter(Value::is_array))?;
            (metadata, list)
        }
        _ => return None,
    };
    let data = records_in(&list)?
        .into_iter()
        .map(normalize_record)
        .collect();
    Some(StageArtifact { metadata, data })
}

// ── Writing ──────────────────────────────────────────────────────────────

/// Write bytes atomically: temp file beside the target, then rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let fail = |source| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, bytes).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;
    Ok(())
}

/// Pretty-print `value` as UTF-8 JSON (no BOM) and write it atomically.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("serialise {}: {e}", path.display())))?;
    write_atomic(path, text.as_bytes()).await
}

/// Write a CSV companion (UTF-8 with BOM, `;` delimited).
///
/// Columns are the union of record keys in first-seen order. Returns
/// `Ok(false)` without writing when any value is nested and the records
/// therefore do not form a flat table.
pub async fn write_csv(path: &Path, records: &[Record]) -> Result<bool, PipelineError> {
    let rendered = render_csv(records).map_err(|e| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    match rendered {
        Some(bytes) => {
            write_atomic(path, &bytes).await?;
            Ok(true)
        }
        None => {
            debug!("Skipping CSV {}: records are not flat", path.display());
            Ok(false)
        }
    }
}

fn render_csv(records: &[Record]) -> Result<Option<Vec<u8>>, csv::Error> {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for (key, value) in record {
            if value.is_object() || value.is_array() {
                return Ok(None);
            }
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .terminator(csv::Terminator::CRLF)
        .from_writer(UTF8_BOM.as_bytes().to_vec());
    writer.write_record(&columns)?;
    for record in records {
        writer.write_record(columns.iter().map(|c| field_str(record, c)))?;
    }
    let bytes = writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn new_artifact_has_required_metadata() {
        let a = StageArtifact::new("J", vec![rec(json!({"PointId": "1050030001"}))])
            .with_meta("model_used", "gemini-2.5-pro");
        assert_eq!(a.meta_str("stage"), Some("J"));
        assert_eq!(a.metadata["total_records"], json!(1));
        assert!(a.meta_str("processed_at").unwrap().contains('T'));
        assert_eq!(a.meta_str("model_used"), Some("gemini-2.5-pro"));
    }

    #[test]
    fn normalize_renames_aliases_in_place() {
        let r = normalize_record(rec(json!({
            "point_id": 1050030001u64,
            "Topic": "Cells",
            "مبحث": "ignored duplicate",
            "Imp": 0
        })));
        let keys: Vec<_> = r.keys().cloned().collect();
        assert_eq!(keys, ["PointId", "topic", "Imp"]);
        assert_eq!(r["PointId"], json!("1050030001"));
        assert_eq!(r["topic"], json!("Cells"));
    }

    #[test]
    fn canonical_key_beats_alias() {
        let r = normalize_record(rec(json!({"topic": "a", "Topic": "b"})));
        assert_eq!(r.len(), 1);
        assert_eq!(r["topic"], json!("a"));
    }

    #[test]
    fn zero_is_preserved_as_string() {
        assert_eq!(value_to_string(&json!(0)), "0");
        assert_eq!(value_to_string(&json!("0")), "0");
        assert_eq!(value_to_string(&json!(false)), "false");
        assert_eq!(value_to_string(&Value::Null), "");
    }

    #[test]
    fn historical_shapes_are_accepted() {
        for v in [
            json!({"metadata": {"stage": "x"}, "points": [{"PointId": "1"}]}),
            json!({"rows": [{"PointId": "1"}]}),
            json!([{"PointId": "1"}]),
        ] {
            let a = artifact_from_value(v).unwrap();
            assert_eq!(a.data.len(), 1);
        }
        assert!(artifact_from_value(json!({"metadata": {}})).is_none());
    }

    #[test]
    fn records_in_digs_through_payload() {
        let v = json!({"chunk_index": 1, "payload": {"content": [{"a": 1}, 3]}});
        assert_eq!(records_in(&v).unwrap(), vec![rec(json!({"a": 1}))]);
    }

    #[test]
    fn csv_has_bom_and_semicolons() {
        let rows = vec![
            rec(json!({"Number": "1", "text": "a;b"})),
            rec(json!({"Number": "2", "extra": 0})),
        ];
        let csv = String::from_utf8(render_csv(&rows).unwrap().unwrap()).unwrap();
        assert!(csv.starts_with(UTF8_BOM));
        let lines: Vec<_> = csv.trim_start_matches(UTF8_BOM).lines().collect();
        assert_eq!(lines[0], "Number;text;extra");
        assert_eq!(lines[1], "1;\"a;b\";");
        assert_eq!(lines[2], "2;;0");
    }

    #[test]
    fn csv_quotes_embedded_quotes_and_newlines() {
        let rows = vec![rec(json!({"Number": "1", "text": "say \"hi\"\nthen go"}))];
        let csv = String::from_utf8(render_csv(&rows).unwrap().unwrap()).unwrap();
        assert!(csv.ends_with("1;\"say \"\"hi\"\"\nthen go\"\r\n"), "got {csv:?}");
    }

    #[test]
    fn nested_records_skip_csv() {
        assert!(render_csv(&[rec(json!({"a": [1]}))]).unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/a1050030.json");
        let a = StageArtifact::new("J", vec![rec(json!({"PointId": "1050030001", "Imp": ""}))]);
        write_json(&path, &a).await.unwrap();
        let back = read_artifact(&path).await.unwrap();
        assert_eq!(back, a);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let err = read_artifact(Path::new("/definitely/not/here.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }
}

//! Left outer join of model output onto upstream records by `PointId`.
//!
//! The upstream side drives: every upstream record appears exactly once,
//! in its original order, and gains every requested column. A column the
//! model did not supply for that PointId is `""`. Model rows whose PointId
//! is not upstream are counted and dropped.

use crate::artifact::{normalize_record, value_to_string, Record};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A column added by the join plus the alternate names a model may use for it.
#[derive(Debug, Clone, Copy)]
pub struct JoinColumn {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
}

impl JoinColumn {
    pub const fn new(name: &'static str, aliases: &'static [&'static str]) -> Self {
        Self { name, aliases }
    }

    /// The first of `name`/aliases present in `row`. A present non-null
    /// value is kept as its string form, so `0` stays `"0"`.
    fn pick(&self, row: &Record) -> Option<String> {
        std::iter::once(self.name)
            .chain(self.aliases.iter().copied())
            .find_map(|k| row.get(k))
            .map(value_to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinResult {
    pub records: Vec<Record>,
    /// Upstream records that received a model row.
    pub matched: usize,
    /// Model rows whose PointId is not upstream.
    pub unmatched_model_rows: usize,
}

/// Join `model_rows` onto `upstream` by `PointId`.
///
/// When the model returns the same PointId twice, the later row wins.
pub fn left_join(upstream: &[Record], model_rows: &[Record], columns: &[JoinColumn]) -> JoinResult {
    let mut by_id: HashMap<String, HashMap<&'static str, String>> = HashMap::new();
    for row in model_rows {
        let row = normalize_record(row.clone());
        let Some(id) = row.get("PointId").map(value_to_string).filter(|s| !s.is_empty()) else {
            continue;
        };
        let entry = by_id.entry(id.trim().to_string()).or_default();
        for col in columns {
            if let Some(v) = col.pick(&row) {
                entry.insert(col.name, v);
            }
        }
    }

    let mut matched = 0;
    let records = upstream
        .iter()
        .map(|record| {
            let mut out = record.clone();
            let id = record
                .get("PointId")
                .map(value_to_string)
                .unwrap_or_default();
            let found = by_id.get(id.trim());
            if found.is_some() {
                matched += 1;
            }
            for col in columns {
                let v = found
                    .and_then(|m| m.get(col.name))
                    .cloned()
                    .unwrap_or_default();
                out.insert(col.name.to_string(), Value::String(v));
            }
            out
        })
        .collect();

    let upstream_ids: HashSet<String> = upstream
        .iter()
        .filter_map(|r| r.get("PointId").map(|v| value_to_string(v).trim().to_string()))
        .collect();
    let unmatched_model_rows = by_id.keys().filter(|id| !upstream_ids.contains(*id)).count();
    debug!(
        "Join: {} of {} upstream records matched, {} model rows unmatched",
        matched,
        upstream.len(),
        unmatched_model_rows
    );
    JoinResult {
        records,
        matched,
        unmatched_model_rows,
    }
}

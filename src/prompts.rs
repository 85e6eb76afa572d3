//! Fixed instruction text the pipeline wraps around operator prompts.
//!
//! Operator prompts are opaque configuration (see [`crate::config::PromptBook`]).
//! What lives here is the glue every run needs regardless of wording: page
//! range constraints, the chunk envelope contract, output-shape reminders and
//! the data section headers.
//!
//! Centralising the glue means a unit test can assert on it directly, and a
//! wording change to a shared constraint touches exactly one place.

/// Substituted with the configured chapter name.
pub const CHAPTER_NAME_TOKEN: &str = "{CHAPTER_NAME}";

/// Substituted with the topic a part is scoped to.
pub const TOPIC_NAME_TOKEN: &str = "{TOPIC_NAME}";

/// Substitute the named placeholders in an operator template.
///
/// Pure string replacement; unknown braces are left alone.
pub fn fill_template(template: &str, chapter_name: &str, topic: Option<&str>) -> String {
    let filled = template.replace(CHAPTER_NAME_TOKEN, chapter_name);
    match topic {
        Some(t) => filled.replace(TOPIC_NAME_TOKEN, t),
        None => filled,
    }
}

/// Constraint appended to a prompt scoped to a page range.
pub fn page_range_suffix(start: usize, end: usize) -> String {
    format!("\n\nIMPORTANT: Process ONLY pages {start} to {end} of the PDF. Output JSON format.")
}

/// Constraint appended to a prompt scoped to one topic.
pub fn topic_suffix(topic: &str) -> String {
    format!(
        "\n\nIMPORTANT: Process ONLY the content of the topic \"{topic}\". \
         Output JSON format."
    )
}

/// Shape of every reply in continuation mode.
pub const ENVELOPE_CONTRACT: &str = r#"

OUTPUT CONTRACT (chunked mode)
Return exactly one JSON object per reply, with no text outside it:
{
  "chunk_index": <int, the chunk index requested below>,
  "is_last": <true when nothing remains after this chunk, else false>,
  "payload": { "content": [ ... items for this chunk only ... ] },
  "next_cursor": <object telling you where to resume, or null when is_last is true>
}
Keep each chunk small enough to finish without truncation. Never repeat
items already returned in an earlier chunk."#;

/// The per-chunk input block for continuation mode.
pub fn envelope_request(inputs: &str, chunk_index: usize, cursor: Option<&str>) -> String {
    let mut out = format!(
        "\n\n==================================================\n\
         INPUTS FOR THIS CHUNK\n\
         ==================================================\n\n\
         {inputs}\n\nChunk index (requested): {chunk_index}\n"
    );
    if let Some(cursor) = cursor {
        out.push_str(
            "\nPrevious cursor (read-only, for continuation; do NOT copy it into payload):\n",
        );
        out.push_str(cursor);
        out.push('\n');
    }
    out
}

/// A titled data section appended after the operator prompt.
pub fn section(title: &str, body: &str) -> String {
    format!("\n\n==================================================\n{title}\n==================================================\n{body}\n")
}

/// Instruction for one Stage 2 part.
pub fn part_rows_instruction(part: i64) -> String {
    format!(
        "\n\nThese rows belong to Part {part}. Process them as instructed above and \
         return a JSON array of rows. Keep the \"Part\" field on every row."
    )
}

/// Reply shape for the importance/type pass.
pub const IMPORTANCE_OUTPUT_SHAPE: &str = r#"

Return a JSON object of the form:
{"data": [{"PointId": "<exact PointId from the input>", "Imp": "<importance>", "Type": "<type>"}]}
Use EXACT field names PointId, Imp and Type. PointId must be a STRING copied
from the input. Return ONLY valid JSON."#;

/// Reply shape for the flashcard pass.
pub const FLASHCARD_OUTPUT_SHAPE: &str = r#"

Return a JSON object of the form:
{"data": [{"PointId": "<exact PointId>", "Qtext": "...", "Choice1": "...", "Choice2": "...",
           "Choice3": "...", "Choice4": "...", "Correct": "<1-4>"}]}
Use EXACT field names. PointId must be a STRING copied from the input.
Return ONLY valid JSON."#;

/// Reply shape for the chapter overview.
pub const OVERVIEW_OUTPUT_SHAPE: &str = r#"

Return a JSON object of the form:
{"data": [{"chapter": "...", "subchapter": "...", "topic": "...", "summary": "...",
           "num_points": <int>, "num_questions": <int>}]}
Use EXACT field names. Do NOT include explanations outside the JSON."#;

/// Used to transcribe an old edition when no `stage_x_extraction` prompt is configured.
pub const DEFAULT_OLD_EDITION_PROMPT: &str = r#"You are transcribing a textbook chapter.
Return every paragraph of the given pages, in reading order, as a JSON object:
{"rows": [{"Number": "<page>.<paragraph>", "text": "<paragraph text>"}]}
Keep the original language and wording. Return ONLY valid JSON."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_range_wording() {
        assert_eq!(
            page_range_suffix(11, 20),
            "\n\nIMPORTANT: Process ONLY pages 11 to 20 of the PDF. Output JSON format."
        );
    }

    #[test]
    fn template_substitution() {
        let t = "Chapter {CHAPTER_NAME}, topic {TOPIC_NAME}, {other}";
        assert_eq!(
            fill_template(t, "Cells", Some("Mitosis")),
            "Chapter Cells, topic Mitosis, {other}"
        );
        assert_eq!(fill_template(t, "Cells", None), "Chapter Cells, topic {TOPIC_NAME}, {other}");
    }

    #[test]
    fn envelope_request_carries_cursor() {
        let with = envelope_request("{}", 3, Some("{\"next_page\": 7}"));
        assert!(with.contains("Chunk index (requested): 3"));
        assert!(with.contains("{\"next_page\": 7}"));
        let without = envelope_request("{}", 1, None);
        assert!(!without.contains("Previous cursor"));
    }

    #[test]
    fn contract_names_every_envelope_field() {
        for field in ["chunk_index", "is_last", "payload", "next_cursor"] {
            assert!(ENVELOPE_CONTRACT.contains(field), "{field}");
        }
    }
}

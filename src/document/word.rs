//! Word-document reader.
//!
//! `.docx` files are zip archives; the body text lives in
//! `word/document.xml`. Paragraph ends become newlines and tabs are kept, so
//! the model sees the same line structure a reader would. Any other file
//! extension is read as UTF-8 text.

use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

static RE_RUN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|</w:p>|<w:tab/>|<w:br/>").unwrap());

/// Read the document's plain text.
pub async fn read_word(path: &Path) -> Result<String, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let owned = path.to_path_buf();
    let text = tokio::task::spawn_blocking(move || read_word_blocking(&owned))
        .await
        .map_err(|e| PipelineError::Internal(format!("word reader panicked: {e}")))??;
    if text.trim().is_empty() {
        warn!("Word document {} has no text", path.display());
    }
    info!("Read {} chars from {}", text.len(), path.display());
    Ok(text)
}

fn read_word_blocking(path: &Path) -> Result<String, PipelineError> {
    let fail = |detail: String| PipelineError::WordReadFailed {
        path: path.to_path_buf(),
        detail,
    };
    let is_docx = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("docx"));
    if !is_docx {
        return std::fs::read_to_string(path).map_err(|e| fail(e.to_string()));
    }

    let file = std::fs::File::open(path).map_err(|e| fail(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| fail(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| fail(e.to_string()))?
        .read_to_string(&mut xml)
        .map_err(|e| fail(e.to_string()))?;
    Ok(document_xml_to_text(&xml))
}

/// Flatten WordprocessingML body XML to text.
pub fn document_xml_to_text(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len() / 4);
    for caps in RE_RUN_TEXT.captures_iter(xml) {
        match caps.get(1) {
            Some(run) => out.push_str(&decode_entities(run.as_str())),
            None => match &caps[0] {
                "<w:tab/>" => out.push('\t'),
                _ => out.push('\n'),
            },
        }
    }
    out.trim_end().to_string()
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Wrap Word text the way every stage presents it to the model.
pub fn prepare_word_for_model(text: &str, context: &str) -> String {
    format!("Word Document Content ({context}):\n\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BODY: &str = r#"<w:document><w:body>
<w:p><w:r><w:t>Chapter 3</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Cells &amp; </w:t></w:r><w:r><w:tab/><w:t>tissues</w:t></w:r></w:p>
</w:body></w:document>"#;

    #[test]
    fn xml_to_text_keeps_paragraphs_and_tabs() {
        assert_eq!(document_xml_to_text(BODY), "Chapter 3\nCells & \ttissues");
    }

    #[test]
    fn model_wrapper() {
        assert_eq!(
            prepare_word_for_model("abc", "Stage J"),
            "Word Document Content (Stage J):\n\nabc"
        );
    }

    #[tokio::test]
    async fn reads_docx_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.docx");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(BODY.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(read_word(&path).await.unwrap(), "Chapter 3\nCells & \ttissues");
    }

    #[tokio::test]
    async fn plain_text_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(read_word(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn corrupt_docx_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.docx");
        std::fs::write(&path, "not a zip").unwrap();
        let err = read_word(&path).await.unwrap_err();
        assert!(matches!(err, PipelineError::WordReadFailed { .. }));
    }
}

//! Source-document collaborators: PDF page counting/text and Word reading.
//!
//! ## Why a trait?
//!
//! Stages never touch pdfium directly. They go through [`DocumentSource`],
//! which lets the integration tests drive a full pipeline over a scripted
//! twenty-page "PDF" without a native library on the machine.

pub mod word;

use crate::error::PipelineError;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Page counting and text extraction for PDF inputs.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn count_pages(&self, path: &Path) -> Result<usize, PipelineError>;

    /// Text of pages `start..=end` (1-based, inclusive), pages joined by blank lines.
    async fn extract_text_range(
        &self,
        path: &Path,
        start: usize,
        end: usize,
    ) -> Result<String, PipelineError>;

    /// Raw bytes for attaching the document to a model request.
    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, PipelineError> {
        validate_pdf(path)?;
        tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::Internal(format!("read {}: {e}", path.display())))
    }
}

/// Check existence, readability and the `%PDF` magic bytes.
pub fn validate_pdf(path: &Path) -> Result<(), PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    match std::fs::File::open(path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(PipelineError::NotAPdf {
                    path: path.to_path_buf(),
                    magic,
                });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

// ── pdfium implementation ────────────────────────────────────────────────

/// [`DocumentSource`] backed by pdfium.
///
/// The library is bound from `library_dir` when set (usually from
/// `PDFIUM_LIB_PATH`), otherwise from the system library path. pdfium keeps
/// thread-local state and blocks, so every call runs in `spawn_blocking`.
#[derive(Debug, Clone, Default)]
pub struct PdfiumDocuments {
    library_dir: Option<PathBuf>,
}

impl PdfiumDocuments {
    pub fn new(library_dir: Option<PathBuf>) -> Self {
        Self { library_dir }
    }

    /// Use `PDFIUM_LIB_PATH` when present.
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from))
    }
}

fn bind_pdfium(library_dir: Option<&Path>) -> Result<Pdfium, PipelineError> {
    let bindings = match library_dir {
        Some(dir) if dir.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
        }
        Some(file) => Pdfium::bind_to_library(file),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn open_and<T>(
    library_dir: Option<&Path>,
    path: &Path,
    f: impl FnOnce(&PdfDocument<'_>) -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let pdfium = bind_pdfium(library_dir)?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })?;
    f(&document)
}

fn extract_range_blocking(
    document: &PdfDocument<'_>,
    path: &Path,
    start: usize,
    end: usize,
) -> Result<String, PipelineError> {
    let pages = document.pages();
    let total = pages.len() as usize;
    let last = end.min(total);
    let mut buffer = String::new();
    for page_num in start.max(1)..=last {
        let text = pages
            .get((page_num - 1) as u16)
            .and_then(|page| page.text().map(|t| t.all()))
            .map_err(|e| PipelineError::CorruptPdf {
                path: path.to_path_buf(),
                detail: format!("page {page_num}: {e:?}"),
            })?;
        if !buffer.is_empty() && !text.is_empty() {
            buffer.push_str("\n\n");
        }
        buffer.push_str(&text);
    }
    debug!(
        "Extracted {} chars from pages {}-{} of {}",
        buffer.len(),
        start,
        last,
        path.display()
    );
    Ok(buffer)
}

#[async_trait]
impl DocumentSource for PdfiumDocuments {
    async fn count_pages(&self, path: &Path) -> Result<usize, PipelineError> {
        validate_pdf(path)?;
        let path = path.to_path_buf();
        let lib = self.library_dir.clone();
        let total = tokio::task::spawn_blocking(move || {
            open_and(lib.as_deref(), &path, |doc| Ok(doc.pages().len() as usize))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("pdfium task panicked: {e}")))??;
        info!("PDF has {} pages", total);
        Ok(total)
    }

    async fn extract_text_range(
        &self,
        path: &Path,
        start: usize,
        end: usize,
    ) -> Result<String, PipelineError> {
        validate_pdf(path)?;
        let path = path.to_path_buf();
        let lib = self.library_dir.clone();
        tokio::task::spawn_blocking(move || {
            open_and(lib.as_deref(), &path, |doc| {
                extract_range_blocking(doc, &path, start, end)
            })
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("pdfium task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("fake.pdf");
        std::fs::write(&p, b"PK\x03\x04rest").unwrap();
        let err = validate_pdf(&p).unwrap_err();
        assert!(matches!(err, PipelineError::NotAPdf { magic, .. } if &magic == b"PK\x03\x04"));
    }

    #[test]
    fn missing_pdf() {
        let err = validate_pdf(Path::new("/nope/missing.pdf")).unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[test]
    fn accepts_pdf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ok.pdf");
        std::fs::write(&p, b"%PDF-1.7\n").unwrap();
        assert!(validate_pdf(&p).is_ok());
    }
}

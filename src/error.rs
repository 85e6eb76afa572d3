//! Error types for the content-pipeline library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] - **Fatal** for the stage that hit it: a required
//!   input is missing, a PointId is malformed, the credential pool is empty
//!   or exhausted. The orchestrator catches it at the stage boundary and
//!   records the stage as FAILED; it never crosses into other stages.
//!
//! * [`UnitError`] - **Non-fatal**: one part, topic, or batch of a stage
//!   failed (provider gave up, response held no JSON) but the other units
//!   are fine. Units are logged and listed in artifact metadata; the stage
//!   only fails when *zero* units produced usable data.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the content-pipeline library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/dir-containing-libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    /// The Word document could not be opened or decoded.
    #[error("Failed to read Word document '{path}': {detail}")]
    WordReadFailed { path: PathBuf, detail: String },

    /// A PointId was not exactly ten ASCII digits.
    #[error("Invalid PointId '{value}': expected exactly 10 digits (BBBCCCPPPP)")]
    InvalidPointId { value: String },

    /// An upstream artifact exists but its JSON does not have a usable shape.
    #[error("Malformed artifact '{path}': {detail}")]
    MalformedArtifact { path: PathBuf, detail: String },

    /// A required upstream artifact or auxiliary input is absent.
    #[error("Missing input for stage {stage}: {detail}")]
    MissingInput { stage: String, detail: String },

    // ── Credential errors ─────────────────────────────────────────────────
    /// The credential file held no row with a non-empty api_key.
    #[error("No usable credentials in '{path}'\nExpected rows of: account;project;api_key")]
    NoCredentials { path: PathBuf },

    /// Every credential in the pool was tried during one call and none worked.
    #[error("All {tried} credentials for provider '{provider}' failed.\nLast error: {last_error}")]
    PoolExhausted {
        provider: String,
        tried: usize,
        last_error: String,
    },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// Rate-limit retries and rotation were exhausted.
    #[error("Rate limit exceeded for provider '{provider}' after retries and key rotation")]
    RateLimitExceeded { provider: String },

    /// The LLM API returned a non-retryable error (bad request, safety block).
    #[error("LLM API error: {message}")]
    LlmApiError { message: String },

    /// Every unit of a stage failed; there is nothing to persist.
    #[error("Stage {stage}: all {total} units failed.\nFirst error: {first_error}")]
    NoUsableOutput {
        stage: String,
        total: usize,
        first_error: String,
    },

    // ── Orchestration errors ──────────────────────────────────────────────
    /// A hard upstream dependency did not succeed in this run.
    #[error("Stage {upstream} must complete successfully before Stage {stage}")]
    DependencyUnmet { stage: String, upstream: String },

    /// The run was cancelled through its [`crate::CancelToken`].
    #[error("Cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        PipelineError::MalformedArtifact {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn missing(stage: impl std::fmt::Display, detail: impl Into<String>) -> Self {
        PipelineError::MissingInput {
            stage: stage.to_string(),
            detail: detail.into(),
        }
    }
}

/// A non-fatal error for a single unit (part, topic, or batch) of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum UnitError {
    /// The provider call failed after retries and rotation.
    #[error("{unit}: LLM call failed: {detail}")]
    LlmFailed { unit: String, detail: String },

    /// The call returned text but no JSON could be recovered from it.
    #[error("{unit}: no JSON could be extracted (raw response kept in {raw_path})")]
    ExtractionFailed { unit: String, raw_path: String },

    /// The run was cancelled before this unit finished.
    #[error("{unit}: cancelled")]
    Cancelled { unit: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_unmet_names_both_stages() {
        let e = PipelineError::DependencyUnmet {
            stage: "J".into(),
            upstream: "E".into(),
        };
        assert_eq!(
            e.to_string(),
            "Stage E must complete successfully before Stage J"
        );
    }

    #[test]
    fn no_usable_output_display() {
        let e = PipelineError::NoUsableOutput {
            stage: "V".into(),
            total: 4,
            first_error: "topic a: cancelled".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("all 4 units"), "got: {msg}");
        assert!(msg.contains("topic a"), "got: {msg}");
    }

    #[test]
    fn pool_exhausted_display() {
        let e = PipelineError::PoolExhausted {
            provider: "gemini".into(),
            tried: 3,
            last_error: "API key leaked".into(),
        };
        assert!(e.to_string().contains("All 3 credentials"));
        assert!(e.to_string().contains("gemini"));
    }

    #[test]
    fn unit_error_serializes() {
        let e = UnitError::ExtractionFailed {
            unit: "part 2".into(),
            raw_path: "/tmp/x_part2.txt".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("ExtractionFailed"));
        assert!(e.to_string().starts_with("part 2:"));
    }
}

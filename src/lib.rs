//! # content-pipeline
//!
//! Turn a textbook chapter PDF into structured teaching material with a
//! chain of LLM passes.
//!
//! ## Why stages?
//!
//! One prompt cannot transcribe forty pages, rebuild their outline, rate
//! every point and write a test bank. Each stage does one of those jobs,
//! reads the artifacts of the stages before it, and writes its own artifact
//! under a predictable name. A failed stage can be rerun on its own with
//! `resume_from` and every earlier result is picked up from disk.
//!
//! ## Pipeline Overview
//!
//! ```text
//! chapter PDF
//!  │
//!  ├─ 1  OCR extraction      page halves, attached PDF      s1_BBBCCC.json
//!  ├─ 2  per-part cleanup    one call per Part              s2_BBBCCC.json
//!  ├─ 3  structure           continuation envelope          s3_BBBCCC.json
//!  ├─ 4  hierarchy → points  envelope + PointId allocation  s4_BBBCCC.json
//!  ├─ E  image notes         one call, ids continue         eBBBCCC.json
//!  ├─ F  image catalog       no model                       f.json
//!  ├─ J  importance / type   batches of 200, left join      aBBBCCC.json
//!  └─ V  test bank           per topic, three steps         bBBBCCC+name.json
//!
//!  optional:  H flashcards · M topic index · L overview
//!  extension: X edition changes · Y deletions · Z rich-text report
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use content_pipeline::{
//!     CancelToken, CredentialPool, PdfiumDocuments, PipelineConfig, PipelineContext,
//!     PipelineOrchestrator, PromptBook,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .pdf_path("chapter3.pdf")
//!         .start_point_id("1050030001")
//!         .chapter_name("Cells")
//!         .word_file("chapter3.docx")
//!         .prompts(PromptBook::load(Path::new("prompts.json")).await?)
//!         .build()?;
//!     let gemini = CredentialPool::load(Path::new("gemini_keys.csv")).await?;
//!     let ctx = PipelineContext::with_pools(
//!         config,
//!         Arc::new(PdfiumDocuments::default()),
//!         CancelToken::new(),
//!         Some(gemini),
//!         None,
//!     )?;
//!     let report = PipelineOrchestrator::new(ctx).run().await?;
//!     eprint!("{}", report.console_summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `content-pipeline` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! content-pipeline = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifact;
pub mod cancel;
pub mod chunked;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod json_repair;
pub mod llm;
pub mod orchestrator;
pub mod point_id;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod stages;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifact::{Record, StageArtifact};
pub use cancel::CancelToken;
pub use chunked::ChunkedDocumentProcessor;
pub use config::{PipelineConfig, PipelineConfigBuilder, PromptBook, PromptKey};
pub use context::PipelineContext;
pub use document::{DocumentSource, PdfiumDocuments};
pub use error::{PipelineError, UnitError};
pub use llm::{ClientSettings, CredentialPool, KeyRotationClient, LlmBackend, Provider};
pub use orchestrator::{ExecutionReport, PipelineOrchestrator, StageResult, StageStatus};
pub use point_id::PointId;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback, StagePhase};
pub use stages::{StageId, StageInputs, StageOutcome, StageProcessor};

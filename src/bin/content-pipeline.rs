//! CLI binary for content-pipeline.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, loads the credential pools, runs the orchestrator and
//! prints the execution summary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use content_pipeline::config::DEFAULT_MODEL;
use content_pipeline::stages::parse_stage_list;
use content_pipeline::{
    CancelToken, CredentialPool, ExecutionReport, PdfiumDocuments, PipelineConfig,
    PipelineContext, PipelineOrchestrator, PipelineProgressCallback, ProgressCallback, PromptBook,
    StageId, StagePhase, StageResult, StageStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────

/// One bar over the stage list; units and stage results are printed above it.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:32.green/238}] {pos}/{len} stages  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Pipeline");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_pipeline_start(&self, stages: &[StageId]) {
        self.bar.set_length(stages.len() as u64);
        let labels: Vec<String> = stages.iter().map(|s| s.to_string()).collect();
        self.bar
            .println(bold(&format!("◆ Running stages {}", labels.join(","))));
    }

    fn on_stage_start(&self, stage: StageId, _position: usize, _total: usize) {
        self.bar.set_prefix(format!("Stage {stage}"));
        self.bar.set_message(stage.description());
    }

    fn on_stage_phase(&self, stage: StageId, phase: StagePhase) {
        self.bar.set_message(format!("{}: {phase}", stage.description()));
    }

    fn on_unit_complete(&self, stage: StageId, unit: usize, total: usize) {
        self.bar.set_message(format!("{}: unit {unit}/{total}", stage.description()));
    }

    fn on_unit_error(&self, stage: StageId, unit: usize, total: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Stage {stage} unit {unit}/{total}  {}",
            red("✗"),
            red(&msg)
        ));
    }

    fn on_stage_complete(&self, stage: StageId, result: &StageResult) {
        let timing = dim(&format!("{:.1}s", result.duration_secs));
        let line = match result.status {
            StageStatus::Success => format!(
                "  {} Stage {:<2} {:<24} {}  {}",
                green("✓"),
                stage,
                stage.description(),
                dim(&format!("{} records", result.records.unwrap_or_default())),
                timing
            ),
            StageStatus::Skipped => format!(
                "  {} Stage {:<2} {:<24} {}",
                yellow("–"),
                stage,
                stage.description(),
                yellow(result.message.as_deref().unwrap_or("skipped"))
            ),
            StageStatus::Failed => format!(
                "  {} Stage {:<2} {:<24} {}  {}",
                red("✗"),
                stage,
                stage.description(),
                red(result.message.as_deref().unwrap_or("failed").lines().next().unwrap_or_default()),
                timing
            ),
        };
        self.bar.println(line);
        self.bar.inc(1);
    }

    fn on_pipeline_complete(&self, _report: &ExecutionReport) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Default chain 1,2,3,4,E,F,J,V
  content-pipeline chapter3.pdf --point-id 1050030001 --chapter-name Cells \
      --prompts prompts.json --gemini-keys keys.csv --word-file notes.docx

  # Resume after a failed Stage J, reusing earlier artifacts in ./output
  content-pipeline chapter3.pdf --point-id 1050030001 --prompts prompts.json \
      --gemini-keys keys.csv --word-file notes.docx --resume-from J

  # Edition comparison only
  content-pipeline chapter3.pdf --point-id 1050030001 --prompts prompts.json \
      --gemini-keys keys.csv --old-book old3.pdf --stages X,Y,Z

STAGES:
  1 OCR extraction      2 per-part cleanup     3 structure          4 points
  E image notes         F image catalog        J importance/type    V test bank
  H flashcards          M topic index          L overview
  X edition changes     Y edition deletions    Z rich-text report

CREDENTIAL FILES:
  One credential per line, `account;project;api_key` (a header row is allowed).
  Keys are rotated on quota or leak errors and never appear in logs or reports.

ENVIRONMENT VARIABLES:
  CONTENT_PIPELINE_*   Every flag below (see each flag's [env:] note)
  PDFIUM_LIB_PATH      Directory or file of the pdfium shared library
  RUST_LOG             Override the log filter
"#;

/// Run the multi-stage LLM content pipeline over a chapter PDF.
#[derive(Parser, Debug)]
#[command(
    name = "content-pipeline",
    version,
    about = "Run the multi-stage LLM content pipeline over a textbook chapter PDF",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Chapter PDF (current edition).
    #[arg(env = "CONTENT_PIPELINE_PDF")]
    pdf: PathBuf,

    /// First PointId of the chapter, ten digits BBBCCCPPPP.
    #[arg(long, env = "CONTENT_PIPELINE_POINT_ID")]
    point_id: String,

    /// Chapter name used in prompts and in the V and Z file names.
    #[arg(long, env = "CONTENT_PIPELINE_CHAPTER_NAME", default_value = "")]
    chapter_name: String,

    /// Directory for every artifact and the execution report.
    #[arg(short, long, env = "CONTENT_PIPELINE_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// JSON prompt book: {"stage1": {"prompt": "...", "model": "..."}, ...}.
    #[arg(long, env = "CONTENT_PIPELINE_PROMPTS")]
    prompts: PathBuf,

    /// Gemini credential file.
    #[arg(long, visible_alias = "credentials", env = "CONTENT_PIPELINE_GEMINI_KEYS")]
    gemini_keys: Option<PathBuf>,

    /// DeepSeek credential file.
    #[arg(long, env = "CONTENT_PIPELINE_DEEPSEEK_KEYS")]
    deepseek_keys: Option<PathBuf>,

    /// Word document with teaching notes (Stages J and V).
    #[arg(long, env = "CONTENT_PIPELINE_WORD_FILE")]
    word_file: Option<PathBuf>,

    /// Previous edition of the chapter (Stages X and Y).
    #[arg(long, env = "CONTENT_PIPELINE_OLD_BOOK")]
    old_book: Option<PathBuf>,

    /// Comma-separated stage list.
    #[arg(long, env = "CONTENT_PIPELINE_STAGES", default_value = "1,2,3,4,E,F,J,V")]
    stages: String,

    /// Start at this stage; earlier artifacts are read from the output directory.
    #[arg(long, env = "CONTENT_PIPELINE_RESUME_FROM")]
    resume_from: Option<String>,

    /// Model for prompts that name none.
    #[arg(long, env = "CONTENT_PIPELINE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "CONTENT_PIPELINE_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    /// Requested output tokens per call, clamped per model.
    #[arg(long, env = "CONTENT_PIPELINE_MAX_TOKENS", default_value_t = 32_768)]
    max_tokens: u32,

    /// Seconds to pause between units of one stage.
    #[arg(long, env = "CONTENT_PIPELINE_DELAY", default_value_t = 5)]
    delay: u64,

    /// Continuation limit for envelope-mode stages.
    #[arg(long, env = "CONTENT_PIPELINE_MAX_CHUNKS", default_value_t = 50)]
    max_chunks: usize,

    /// Records per Stage J call.
    #[arg(long, env = "CONTENT_PIPELINE_J_BATCH", default_value_t = 200)]
    j_batch: usize,

    /// Records per Stage H call.
    #[arg(long, env = "CONTENT_PIPELINE_H_BATCH", default_value_t = 120)]
    h_batch: usize,

    /// Records per Stage X call.
    #[arg(long, env = "CONTENT_PIPELINE_X_BATCH", default_value_t = 200)]
    x_batch: usize,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "CONTENT_PIPELINE_API_TIMEOUT", default_value_t = 600)]
    api_timeout: u64,

    /// Directory or file of the pdfium library.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium: Option<PathBuf>,

    /// Print the execution report as JSON on stdout.
    #[arg(long, env = "CONTENT_PIPELINE_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "CONTENT_PIPELINE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CONTENT_PIPELINE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CONTENT_PIPELINE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress).await?;

    // ── Credentials ──────────────────────────────────────────────────────
    let gemini = match &cli.gemini_keys {
        Some(path) => Some(
            CredentialPool::load(path)
                .await
                .with_context(|| format!("Failed to load Gemini credentials from {}", path.display()))?,
        ),
        None => None,
    };
    let deepseek = match &cli.deepseek_keys {
        Some(path) => Some(
            CredentialPool::load(path)
                .await
                .with_context(|| format!("Failed to load DeepSeek credentials from {}", path.display()))?,
        ),
        None => None,
    };
    if gemini.is_none() && deepseek.is_none() {
        bail!("no credentials given: pass --gemini-keys and/or --deepseek-keys");
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the run");
            on_signal.cancel();
        }
    });

    let documents = Arc::new(PdfiumDocuments::new(cli.pdfium.clone()));
    let ctx = PipelineContext::with_pools(config, documents, cancel, gemini, deepseek)
        .context("Failed to set up the model client")?;
    let report = PipelineOrchestrator::new(ctx)
        .run()
        .await
        .context("Failed to write the execution report")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        let mark = if report.all_ok() { green("✔") } else { red("✘") };
        eprint!("{mark} {}", report.console_summary());
        if let Some(path) = &report.report_path {
            eprintln!("   {}", dim(&path.display().to_string()));
        }
    }

    Ok(if report.all_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let prompts = PromptBook::load(&cli.prompts)
        .await
        .with_context(|| format!("Failed to load prompts from {}", cli.prompts.display()))?;
    let stages = parse_stage_list(&cli.stages).context("Invalid --stages")?;

    let mut builder = PipelineConfig::builder()
        .pdf_path(&cli.pdf)
        .output_dir(&cli.output_dir)
        .chapter_name(&cli.chapter_name)
        .start_point_id(&cli.point_id)
        .stages(stages)
        .prompts(prompts)
        .default_model(&cli.model)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .pacing_delay(Duration::from_secs(cli.delay))
        .max_chunks(cli.max_chunks)
        .importance_batch_size(cli.j_batch)
        .flashcard_batch_size(cli.h_batch)
        .changes_batch_size(cli.x_batch)
        .api_timeout_secs(cli.api_timeout);
    if let Some(path) = &cli.word_file {
        builder = builder.word_file(path);
    }
    if let Some(path) = &cli.old_book {
        builder = builder.old_book_pdf(path);
    }
    if let Some(from) = &cli.resume_from {
        let from: StageId = from.parse().context("Invalid --resume-from")?;
        builder = builder.resume_from(from);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

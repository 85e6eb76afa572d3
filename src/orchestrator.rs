//! Sequencing stages and reporting what happened.
//!
//! [`PipelineOrchestrator`] walks the effective stage list in order. Each
//! stage is resolved against its dependencies, run inside its own tracing
//! span, and recorded as a [`StageResult`]. A stage's error stops at the
//! stage boundary: the run always carries on to the next stage and always
//! ends with an [`ExecutionReport`].
//!
//! ## Why predictable file names?
//!
//! A resumed run has no in-memory results for the stages it skipped. Every
//! stage writes to a name derived from the configured PointId and chapter
//! name ([`StageId::output_path`]), so an upstream that is not part of this
//! run is simply looked up on disk.

use crate::artifact;
use crate::context::PipelineContext;
use crate::error::{PipelineError, UnitError};
use crate::progress::StagePhase;
use crate::stages::{processor_for, StageId, StageInputs, StageProcessor};
use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

// ── Results ──────────────────────────────────────────────────────────────

/// Final state of one stage in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            StageStatus::Success => "SUCCESS",
            StageStatus::Failed => "FAILED",
            StageStatus::Skipped => "SKIPPED",
        })
    }
}

/// What happened to one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: StageId,
    pub description: &'static str,
    pub status: StageStatus,
    /// Primary artifact, for successful stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_outputs: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
    /// Failure message or skip reason, credential-free.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_units: Vec<UnitError>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_secs: f64,
}

impl StageResult {
    fn new(stage: StageId, status: StageStatus, started_at: DateTime<Local>, clock: Instant) -> Self {
        Self {
            stage,
            description: stage.description(),
            status,
            output_path: None,
            extra_outputs: Vec::new(),
            records: None,
            message: None,
            failed_units: Vec::new(),
            started_at,
            finished_at: Local::now(),
            duration_secs: clock.elapsed().as_secs_f64(),
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

/// Status counts over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_stages: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// The record of one run, written as `pipeline_execution_report_*.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// When the run started, `YYYY-mm-dd HH:MM:SS`.
    pub execution_time: String,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub total_duration_secs: f64,
    /// Keyed by stage label, in run order.
    #[serde(serialize_with = "stages_by_label")]
    pub stages: Vec<StageResult>,
    pub summary: ReportSummary,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

fn stages_by_label<S: Serializer>(stages: &[StageResult], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(stages.len()))?;
    for result in stages {
        map.serialize_entry(&format!("Stage {}", result.stage), result)?;
    }
    map.end()
}

impl ExecutionReport {
    fn new(started_at: DateTime<Local>, clock: Instant, stages: Vec<StageResult>) -> Self {
        let count = |s: StageStatus| stages.iter().filter(|r| r.status == s).count();
        let summary = ReportSummary {
            total_stages: stages.len(),
            successful: count(StageStatus::Success),
            failed: count(StageStatus::Failed),
            skipped: count(StageStatus::Skipped),
        };
        Self {
            execution_time: started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            started_at,
            finished_at: Local::now(),
            total_duration_secs: clock.elapsed().as_secs_f64(),
            stages,
            summary,
            report_path: None,
        }
    }

    pub fn result(&self, stage: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn status(&self, stage: StageId) -> Option<StageStatus> {
        self.result(stage).map(|r| r.status)
    }

    /// True when no stage failed.
    pub fn all_ok(&self) -> bool {
        self.summary.failed == 0
    }

    /// `pipeline_execution_report_{YYYYmmdd_HHMMSS}.json`
    pub fn file_name(&self) -> String {
        format!(
            "pipeline_execution_report_{}.json",
            self.started_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Stage labels grouped by final status, for the terminal.
    pub fn console_summary(&self) -> String {
        let mut out = format!(
            "Pipeline finished in {:.1}s: {} stage(s), {} succeeded, {} failed, {} skipped\n",
            self.total_duration_secs,
            self.summary.total_stages,
            self.summary.successful,
            self.summary.failed,
            self.summary.skipped
        );
        for status in [StageStatus::Success, StageStatus::Failed, StageStatus::Skipped] {
            let labels: Vec<String> = self
                .stages
                .iter()
                .filter(|r| r.status == status)
                .map(|r| r.stage.to_string())
                .collect();
            if !labels.is_empty() {
                out.push_str(&format!("  {status:<8} {}\n", labels.join(", ")));
            }
        }
        for r in self.stages.iter().filter(|r| r.status != StageStatus::Success) {
            if let Some(message) = &r.message {
                let first = message.lines().next().unwrap_or_default();
                out.push_str(&format!("  Stage {} ({}): {}\n", r.stage, r.status, first));
            }
        }
        out
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Runs the configured stages over one [`PipelineContext`].
pub struct PipelineOrchestrator {
    ctx: PipelineContext,
    processors: BTreeMap<StageId, Box<dyn StageProcessor>>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("ctx", &self.ctx)
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PipelineOrchestrator {
    /// An orchestrator with the built-in processor for every stage.
    pub fn new(ctx: PipelineContext) -> Self {
        let processors = StageId::ALL.iter().map(|id| (*id, processor_for(*id))).collect();
        Self { ctx, processors }
    }

    /// Replace the processor registered for its stage.
    pub fn with_processor(mut self, processor: Box<dyn StageProcessor>) -> Self {
        self.processors.insert(processor.id(), processor);
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run every stage, then write the report to the output directory.
    ///
    /// Stage failures are recorded in the report; only a failure to write
    /// the report itself is returned as an error.
    pub async fn run(&self) -> Result<ExecutionReport, PipelineError> {
        let mut report = self.execute().await;
        let path = self.ctx.output_dir().join(report.file_name());
        artifact::write_json(&path, &report).await?;
        info!("Execution report written to {}", path.display());
        report.report_path = Some(path);
        self.ctx.progress.on_pipeline_complete(&report);
        Ok(report)
    }

    /// Run every stage and build the report without writing it.
    pub async fn execute(&self) -> ExecutionReport {
        let started_at = Local::now();
        let clock = Instant::now();
        let stages = self.ctx.config.effective_stages();
        let total = stages.len();
        let in_run: HashSet<StageId> = stages.iter().copied().collect();
        info!(
            "Starting pipeline: {} stage(s) [{}]",
            total,
            stages.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",")
        );
        if let Some(from) = self.ctx.config.resume_from {
            info!("Resuming from Stage {}", from);
        }
        self.ctx.progress.on_pipeline_start(&stages);

        let mut results: Vec<StageResult> = Vec::with_capacity(total);
        for (i, &stage) in stages.iter().enumerate() {
            self.ctx.progress.on_stage_start(stage, i + 1, total);
            let result = self.run_stage(stage, &results, &in_run).await;
            log_result(&result);
            self.ctx.progress.on_stage_complete(stage, &result);
            results.push(result);
        }

        let report = ExecutionReport::new(started_at, clock, results);
        info!(
            "Pipeline finished: {} succeeded, {} failed, {} skipped",
            report.summary.successful, report.summary.failed, report.summary.skipped
        );
        report
    }

    async fn run_stage(&self, stage: StageId, done: &[StageResult], in_run: &HashSet<StageId>) -> StageResult {
        let started_at = Local::now();
        let clock = Instant::now();

        if self.ctx.cancel.is_cancelled() {
            return StageResult::new(stage, StageStatus::Failed, started_at, clock).with_message("cancelled");
        }
        let Some(processor) = self.processors.get(&stage) else {
            return StageResult::new(stage, StageStatus::Failed, started_at, clock)
                .with_message(format!("no processor registered for Stage {stage}"));
        };
        if let Some(reason) = processor.skip_reason(&self.ctx) {
            return StageResult::new(stage, StageStatus::Skipped, started_at, clock).with_message(reason);
        }
        let inputs = match self.resolve_inputs(stage, done, in_run) {
            Ok(inputs) => inputs,
            Err(e) => {
                return StageResult::new(stage, StageStatus::Failed, started_at, clock)
                    .with_message(self.ctx.client.redact(&e.to_string()));
            }
        };

        let span = info_span!("stage", id = %stage);
        let outcome = processor.run(&self.ctx, &inputs).instrument(span).await;
        self.ctx.phase(stage, StagePhase::Done);
        match outcome {
            Ok(outcome) => {
                let mut result = StageResult::new(stage, StageStatus::Success, started_at, clock);
                result.output_path = Some(outcome.output_path);
                result.extra_outputs = outcome.extra_outputs;
                result.records = Some(outcome.records);
                result.failed_units = outcome
                    .failed_units
                    .into_iter()
                    .map(|u| self.redact_unit(u))
                    .collect();
                result
            }
            Err(PipelineError::Cancelled) => {
                StageResult::new(stage, StageStatus::Failed, started_at, clock).with_message("cancelled")
            }
            Err(e) => StageResult::new(stage, StageStatus::Failed, started_at, clock)
                .with_message(self.ctx.client.redact(&e.to_string())),
        }
    }

    /// Upstream artifact paths for `stage`.
    ///
    /// An upstream in this run must have succeeded; one outside it is read
    /// from its predictable file. Optional upstreams that are unavailable
    /// are left out.
    fn resolve_inputs(
        &self,
        stage: StageId,
        done: &[StageResult],
        in_run: &HashSet<StageId>,
    ) -> Result<StageInputs, PipelineError> {
        let mut inputs = StageInputs::new();
        for dep in stage.dependencies() {
            if in_run.contains(&dep.stage) {
                let upstream = done.iter().find(|r| r.stage == dep.stage);
                match upstream.and_then(|r| r.output_path.clone().filter(|_| r.is_success())) {
                    Some(path) => inputs.insert(dep.stage, path),
                    None if dep.required => {
                        return Err(PipelineError::DependencyUnmet {
                            stage: stage.to_string(),
                            upstream: dep.stage.to_string(),
                        });
                    }
                    None => info!("Stage {}: optional Stage {} unavailable in this run", stage, dep.stage),
                }
            } else {
                let path = dep.stage.output_path(&self.ctx.config);
                if path.exists() {
                    info!("Stage {}: using existing {}", stage, path.display());
                    inputs.insert(dep.stage, path);
                } else if dep.required {
                    return Err(PipelineError::missing(
                        stage,
                        format!("Stage {} artifact {} not found", dep.stage, path.display()),
                    ));
                }
            }
        }
        Ok(inputs)
    }

    fn redact_unit(&self, unit: UnitError) -> UnitError {
        match unit {
            UnitError::LlmFailed { unit, detail } => UnitError::LlmFailed {
                unit,
                detail: self.ctx.client.redact(&detail),
            },
            other => other,
        }
    }
}

fn log_result(result: &StageResult) {
    match result.status {
        StageStatus::Success => info!(
            "Stage {} succeeded in {:.1}s ({} records, {} failed unit(s))",
            result.stage,
            result.duration_secs,
            result.records.unwrap_or_default(),
            result.failed_units.len()
        ),
        StageStatus::Skipped => warn!(
            "Stage {} skipped: {}",
            result.stage,
            result.message.as_deref().unwrap_or_default()
        ),
        StageStatus::Failed => error!(
            "Stage {} failed: {}",
            result.stage,
            result.message.as_deref().unwrap_or_default()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stage: StageId, status: StageStatus) -> StageResult {
        StageResult::new(stage, status, Local::now(), Instant::now())
    }

    #[test]
    fn summary_counts() {
        let report = ExecutionReport::new(
            Local::now(),
            Instant::now(),
            vec![
                result(StageId::S1, StageStatus::Success),
                result(StageId::S2, StageStatus::Failed).with_message("boom\nsecond line"),
                result(StageId::J, StageStatus::Skipped).with_message("no Word file configured"),
            ],
        );
        assert_eq!(
            report.summary,
            ReportSummary {
                total_stages: 3,
                successful: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert!(!report.all_ok());
        assert_eq!(report.status(StageId::J), Some(StageStatus::Skipped));
        let text = report.console_summary();
        assert!(text.contains("SUCCESS  1"), "got: {text}");
        assert!(text.contains("Stage 2 (FAILED): boom"), "got: {text}");
        assert!(!text.contains("second line"));
    }

    #[test]
    fn report_json_shape() {
        let report = ExecutionReport::new(
            Local::now(),
            Instant::now(),
            vec![result(StageId::S1, StageStatus::Success), result(StageId::E, StageStatus::Failed)],
        );
        let v = serde_json::to_value(&report).unwrap();
        assert!(v["execution_time"].is_string());
        assert_eq!(v["stages"]["Stage 1"]["status"], "SUCCESS");
        assert_eq!(v["stages"]["Stage E"]["stage"], "E");
        assert_eq!(v["summary"]["total_stages"], 2);
        let keys: Vec<&String> = v["stages"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["Stage 1", "Stage E"]);
        assert!(report.file_name().starts_with("pipeline_execution_report_"));
        assert!(report.file_name().ends_with(".json"));
    }
}

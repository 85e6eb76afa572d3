//! Progress-callback trait for stage and unit events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator walks the stage list.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a channel, a terminal progress bar, or a GUI worker
//! without the library knowing how the host application communicates.

use crate::orchestrator::{ExecutionReport, StageResult};
use crate::stages::StageId;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Where a stage is in its load → prompt → invoke → extract → merge → persist cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StagePhase {
    LoadingInputs,
    BuildingPrompt,
    InvokingModel,
    ExtractingJson,
    Merging,
    Persisting,
    Done,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StagePhase::LoadingInputs => "loading inputs",
            StagePhase::BuildingPrompt => "building prompt",
            StagePhase::InvokingModel => "invoking model",
            StagePhase::ExtractingJson => "extracting JSON",
            StagePhase::Merging => "merging",
            StagePhase::Persisting => "persisting",
            StagePhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Called by the orchestrator and stage processors as a run advances.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once with the effective stage list.
    fn on_pipeline_start(&self, stages: &[StageId]) {
        let _ = stages;
    }

    /// Called before a stage's dependencies are checked.
    ///
    /// # Arguments
    /// * `position` - 1-indexed position in the run
    /// * `total`    - number of stages in the run
    fn on_stage_start(&self, stage: StageId, position: usize, total: usize) {
        let _ = (stage, position, total);
    }

    fn on_stage_phase(&self, stage: StageId, phase: StagePhase) {
        let _ = (stage, phase);
    }

    /// A part, topic or batch finished with usable data.
    fn on_unit_complete(&self, stage: StageId, unit: usize, total: usize) {
        let _ = (stage, unit, total);
    }

    /// A part, topic or batch failed; the stage continues.
    fn on_unit_error(&self, stage: StageId, unit: usize, total: usize, error: &str) {
        let _ = (stage, unit, total, error);
    }

    fn on_stage_complete(&self, stage: StageId, result: &StageResult) {
        let _ = (stage, result);
    }

    /// Called once after the report has been written.
    fn on_pipeline_complete(&self, report: &ExecutionReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        phases: AtomicUsize,
        unit_errors: AtomicUsize,
    }

    impl PipelineProgressCallback for Counting {
        fn on_stage_phase(&self, _stage: StageId, _phase: StagePhase) {
            self.phases.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unit_error(&self, _stage: StageId, _unit: usize, _total: usize, _error: &str) {
            self.unit_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_accepts_every_event() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_pipeline_start(&[StageId::S1]);
        cb.on_stage_start(StageId::S1, 1, 1);
        cb.on_stage_phase(StageId::S1, StagePhase::Done);
        cb.on_unit_complete(StageId::S1, 1, 2);
        cb.on_unit_error(StageId::S1, 2, 2, "boom");
    }

    #[test]
    fn overridden_methods_fire() {
        let c = Arc::new(Counting {
            phases: AtomicUsize::new(0),
            unit_errors: AtomicUsize::new(0),
        });
        let cb: ProgressCallback = c.clone();
        cb.on_stage_phase(StageId::J, StagePhase::Merging);
        cb.on_stage_phase(StageId::J, StagePhase::Persisting);
        cb.on_unit_error(StageId::J, 1, 3, "x");
        cb.on_unit_complete(StageId::J, 2, 3);
        assert_eq!(c.phases.load(Ordering::SeqCst), 2);
        assert_eq!(c.unit_errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn phase_display() {
        assert_eq!(StagePhase::ExtractingJson.to_string(), "extracting JSON");
    }
}

#![forbid(unsafe_code)]

use anyhow::Result;
use xray_trace_domain::{
    CandidateSample, RunId, RunRecord, RunUpdate, StepId, StepRecord, StepType,
};

/// Coarse row filter for [`TraceStore::scan_steps`]. Predicates over
/// structured sub-keys are evaluated by callers after the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepFilter {
    pub step_type: Option<StepType>,
}

impl StepFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn by_type(step_type: StepType) -> Self {
        Self {
            step_type: Some(step_type),
        }
    }
}

pub trait TraceStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Insert a run, or merge `outcome_summary`/`ended_at` into the existing row.
    #[allow(clippy::missing_errors_doc)]
    fn upsert_run(&self, run: &RunRecord) -> Result<()>;

    /// Merge an end-update into an existing run. Returns the number of rows
    /// touched; an unknown `run_id` touches none.
    #[allow(clippy::missing_errors_doc)]
    fn end_run(&self, update: &RunUpdate) -> Result<usize>;

    /// Insert a step or fully overwrite the row with the same `step_id`.
    #[allow(clippy::missing_errors_doc)]
    fn replace_step(&self, step: &StepRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_samples(&self, step_id: &StepId, samples: &[CandidateSample]) -> Result<()>;

    /// Replace a step and append its samples as one atomic write.
    #[allow(clippy::missing_errors_doc)]
    fn record_step(&self, step: &StepRecord, samples: &[CandidateSample]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>>;

    /// Steps of one run ordered by `created_at` ascending.
    #[allow(clippy::missing_errors_doc)]
    fn get_steps_for_run(&self, run_id: &RunId) -> Result<Vec<StepRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_samples_for_step(&self, step_id: &StepId) -> Result<Vec<CandidateSample>>;

    /// Full scan of the steps matching `filter`, ordered by `created_at`.
    #[allow(clippy::missing_errors_doc)]
    fn scan_steps(&self, filter: &StepFilter) -> Result<Vec<StepRecord>>;

    /// Most recently inserted runs first.
    #[allow(clippy::missing_errors_doc)]
    fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;
}

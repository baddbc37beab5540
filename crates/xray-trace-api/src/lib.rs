//! Ingestion and query operations over a [`TraceStore`].
//!
//! The free functions take any store and are what the HTTP service and the
//! CLI call into. [`TraceApi`] binds them to a `SQLite` database path and opens
//! a fresh connection per operation.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;
use xray_trace_core::{StepFilter, TraceStore};
use xray_trace_domain::{
    keys, now_utc, FailureReport, FailureRow, IngestAck, RunEndRequest, RunId,
    RunIngestRequest, RunListing, RunRecord, RunSummary, RunTrace, RunWrite, StepIngestRequest,
    StepRecord, StepResults, StepType, TraceStep,
};
use xray_trace_sqlite::SqliteTraceStore;

pub const DEFAULT_RATIO_GT: f64 = 0.83;
pub const DEFAULT_RATIO_LT: f64 = 0.2;
pub const DEFAULT_RECENT_RUNS: usize = 10;

/// Create a run, or fold an end-update into an existing one.
///
/// # Errors
/// Returns a [`xray_trace_domain::TraceError`] for invalid payloads, or a
/// storage error.
pub fn ingest_run<S: TraceStore>(store: &S, request: RunIngestRequest) -> Result<IngestAck> {
    match request.into_write(now_utc())? {
        RunWrite::Upsert(run) => {
            store.upsert_run(&run)?;
            tracing::debug!(run_id = %run.run_id, pipeline = %run.pipeline_name, "run upserted");
        }
        RunWrite::End(update) => {
            let touched = store.end_run(&update)?;
            tracing::debug!(run_id = %update.run_id, touched, "run end-update applied");
        }
    }
    Ok(IngestAck::ok())
}

/// Replace a step and append the samples carried with it.
///
/// # Errors
/// Returns a [`xray_trace_domain::TraceError`] for invalid payloads, or a
/// storage error.
pub fn ingest_step<S: TraceStore>(store: &S, request: StepIngestRequest) -> Result<IngestAck> {
    let (step, samples) = request.into_parts()?;
    store.record_step(&step, &samples)?;
    tracing::debug!(
        step_id = %step.step_id,
        run_id = %step.run_id,
        samples = samples.len(),
        "step recorded"
    );
    Ok(IngestAck::ok())
}

/// Apply the end-run shortcut. Unknown run ids are acknowledged and ignored.
///
/// # Errors
/// Returns a [`xray_trace_domain::TraceError`] for invalid payloads, or a
/// storage error.
pub fn end_run<S: TraceStore>(store: &S, request: RunEndRequest) -> Result<IngestAck> {
    let update = request.into_update(now_utc())?;
    let touched = store.end_run(&update)?;
    if touched == 0 {
        tracing::debug!(run_id = %update.run_id, "end-run for unknown run ignored");
    }
    Ok(IngestAck::ok())
}

/// The replay view of one run: the run row (if any) and its steps in
/// `created_at` order, each with its candidate samples.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn get_run_trace<S: TraceStore>(store: &S, run_id: &RunId) -> Result<RunTrace> {
    let run = store.get_run(run_id)?;
    let mut steps = Vec::new();
    for step in store.get_steps_for_run(run_id)? {
        let samples = store.get_samples_for_step(&step.step_id)?;
        steps.push(TraceStep { step, samples });
    }
    Ok(RunTrace { run, steps })
}

/// Filter steps whose `filtered_ratio` exceeds `threshold`. A missing ratio
/// counts as 0.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn filter_events_above<S: TraceStore>(store: &S, threshold: f64) -> Result<StepResults> {
    filter_steps_by_ratio(store, |ratio| ratio.unwrap_or(0.0) > threshold)
}

/// Filter steps whose `filtered_ratio` is below `threshold`. A missing ratio
/// counts as 1.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn weak_filters_below<S: TraceStore>(store: &S, threshold: f64) -> Result<StepResults> {
    filter_steps_by_ratio(store, |ratio| ratio.unwrap_or(1.0) < threshold)
}

fn filter_steps_by_ratio<S, P>(store: &S, keep: P) -> Result<StepResults>
where
    S: TraceStore,
    P: Fn(Option<f64>) -> bool,
{
    let results = store
        .scan_steps(&StepFilter::by_type(StepType::Filter))?
        .into_iter()
        .filter(|step| keep(step.metrics.number(keys::FILTERED_RATIO)))
        .collect();
    Ok(StepResults { results })
}

/// Steps across all pipelines whose context carries a `failure_mode`, joined
/// with their run. `mode` of `None` or `""` returns every labeled step.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn query_failures<S: TraceStore>(store: &S, mode: Option<&str>) -> Result<FailureReport> {
    let mode = mode.filter(|value| !value.is_empty());
    let mut runs: HashMap<RunId, Option<RunRecord>> = HashMap::new();
    let mut results = Vec::new();

    for step in store.scan_steps(&StepFilter::all())? {
        let Some(failure_mode) = failure_mode_of(&step) else {
            continue;
        };
        if mode.is_some_and(|wanted| wanted != failure_mode) {
            continue;
        }

        let run = match runs.get(&step.run_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = store.get_run(&step.run_id)?;
                runs.insert(step.run_id.clone(), fetched.clone());
                fetched
            }
        };
        let Some(run) = run else {
            continue;
        };

        results.push(FailureRow {
            run_id: step.run_id,
            step_name: step.step_name,
            step_type: step.step_type,
            created_at: step.created_at,
            pipeline_name: run.pipeline_name,
            started_at: run.started_at,
            failure_mode,
        });
    }

    Ok(FailureReport {
        count: results.len(),
        results,
    })
}

fn failure_mode_of(step: &StepRecord) -> Option<String> {
    match step.context.get(keys::FAILURE_MODE)? {
        Value::Null => None,
        Value::String(label) => Some(label.clone()),
        other => Some(other.to_string()),
    }
}

/// Most recently created runs first.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub fn list_recent_runs<S: TraceStore>(store: &S, limit: usize) -> Result<RunListing> {
    let results = store
        .list_recent_runs(limit)?
        .iter()
        .map(RunSummary::from)
        .collect();
    Ok(RunListing { results })
}

/// Trace operations bound to one `SQLite` database file. Queries open it
/// read-only and fail when it does not exist.
#[derive(Debug, Clone)]
pub struct TraceApi {
    db_path: PathBuf,
}

impl TraceApi {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn store(&self) -> Result<SqliteTraceStore> {
        SqliteTraceStore::open(&self.db_path)
    }

    fn reader(&self) -> Result<SqliteTraceStore> {
        SqliteTraceStore::open_query_only(&self.db_path)
    }

    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn migrate(&self) -> Result<()> {
        SqliteTraceStore::open_migrated(&self.db_path).map(|_| ())
    }

    /// # Errors
    /// See [`ingest_run`].
    pub fn ingest_run(&self, request: RunIngestRequest) -> Result<IngestAck> {
        ingest_run(&self.store()?, request)
    }

    /// # Errors
    /// See [`ingest_step`].
    pub fn ingest_step(&self, request: StepIngestRequest) -> Result<IngestAck> {
        ingest_step(&self.store()?, request)
    }

    /// # Errors
    /// See [`end_run`].
    pub fn end_run(&self, request: RunEndRequest) -> Result<IngestAck> {
        end_run(&self.store()?, request)
    }

    /// # Errors
    /// See [`get_run_trace`].
    pub fn get_run_trace(&self, run_id: &RunId) -> Result<RunTrace> {
        get_run_trace(&self.reader()?, run_id)
    }

    /// # Errors
    /// See [`filter_events_above`].
    pub fn filter_events_above(&self, threshold: f64) -> Result<StepResults> {
        filter_events_above(&self.reader()?, threshold)
    }

    /// # Errors
    /// See [`weak_filters_below`].
    pub fn weak_filters_below(&self, threshold: f64) -> Result<StepResults> {
        weak_filters_below(&self.reader()?, threshold)
    }

    /// # Errors
    /// See [`query_failures`].
    pub fn query_failures(&self, mode: Option<&str>) -> Result<FailureReport> {
        query_failures(&self.reader()?, mode)
    }

    /// # Errors
    /// See [`list_recent_runs`].
    pub fn list_recent_runs(&self, limit: usize) -> Result<RunListing> {
        list_recent_runs(&self.reader()?, limit)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use serde_json::json;
    use xray_trace_domain::{CandidateSample, StructuredMap, TraceError};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteTraceStore {
        must(SqliteTraceStore::open_migrated(std::path::Path::new(":memory:")))
    }

    fn create_run(run_id: &str, pipeline: &str) -> RunIngestRequest {
        RunIngestRequest {
            run_id: run_id.to_string(),
            pipeline_name: Some(pipeline.to_string()),
            input_summary: Some([("product_title", json!("Laptop Stand"))].into_iter().collect()),
            outcome_summary: None,
            started_at: Some("2024-05-01T10:00:00Z".to_string()),
            ended_at: None,
            metadata: Some([("env", json!("test"))].into_iter().collect()),
        }
    }

    fn step_request(step_id: &str, run_id: &str, step_type: StepType) -> StepIngestRequest {
        StepIngestRequest {
            step_id: step_id.to_string(),
            run_id: run_id.to_string(),
            step_name: format!("{step_type}_{step_id}"),
            step_type,
            input_summary: None,
            output_summary: None,
            metrics: None,
            reasoning: None,
            context: None,
            created_at: "2024-05-01T10:00:01Z".to_string(),
            samples: None,
        }
    }

    fn filter_step(step_id: &str, ratio: Option<Value>) -> StepIngestRequest {
        let mut request = step_request(step_id, "run-1", StepType::Filter);
        request.metrics = ratio.map(|value| [(keys::FILTERED_RATIO, value)].into_iter().collect());
        request
    }

    fn failure_step(step_id: &str, run_id: &str, mode: Value) -> StepIngestRequest {
        let mut request = step_request(step_id, run_id, StepType::Llm);
        request.context = Some([(keys::FAILURE_MODE, mode)].into_iter().collect());
        request
    }

    fn result_ids(results: &StepResults) -> Vec<&str> {
        results.results.iter().map(|step| step.step_id.as_str()).collect()
    }

    #[test]
    fn end_update_through_ingest_run_keeps_creation_fields() {
        let store = fixture_store();
        must(ingest_run(&store, create_run("run-1", "competitor_match_pipeline")));

        let end_shaped = RunIngestRequest {
            run_id: "run-1".to_string(),
            pipeline_name: Some(String::new()),
            input_summary: Some(StructuredMap::new()),
            outcome_summary: Some([("result", json!("done"))].into_iter().collect()),
            started_at: Some(String::new()),
            ended_at: Some("2024-05-01T10:05:00Z".to_string()),
            metadata: Some(StructuredMap::new()),
        };
        must(ingest_run(&store, end_shaped));

        let trace = must(get_run_trace(&store, &RunId::from("run-1")));
        let run = match trace.run {
            Some(run) => run,
            None => panic!("run missing"),
        };
        assert_eq!(run.pipeline_name, "competitor_match_pipeline");
        assert_eq!(run.input_summary.text("product_title"), Some("Laptop Stand"));
        assert_eq!(run.metadata.text("env"), Some("test"));
        assert_eq!(run.outcome_summary.text("result"), Some("done"));
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn invalid_payloads_surface_validation_errors_without_writing() {
        let store = fixture_store();
        let mut request = create_run("run-1", "pipeline");
        request.started_at = Some("not a timestamp".to_string());

        let err = match ingest_run(&store, request) {
            Ok(ack) => panic!("expected validation failure, got {ack:?}"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::Validation(_))
        ));
        assert!(must(list_recent_runs(&store, 10)).results.is_empty());

        assert!(ingest_step(&store, step_request("  ", "run-1", StepType::Filter)).is_err());
        assert!(must(store.scan_steps(&StepFilter::all())).is_empty());
    }

    #[test]
    fn end_run_for_unknown_id_is_acknowledged() {
        let store = fixture_store();
        let ack = must(end_run(
            &store,
            RunEndRequest {
                run_id: "ghost".to_string(),
                outcome_summary: None,
                ended_at: None,
            },
        ));
        assert_eq!(ack, IngestAck::ok());
        assert!(must(get_run_trace(&store, &RunId::from("ghost"))).run.is_none());
    }

    #[test]
    fn absent_run_trace_is_empty_not_an_error() {
        let store = fixture_store();
        let trace = must(get_run_trace(&store, &RunId::from("missing")));
        assert!(trace.run.is_none());
        assert!(trace.steps.is_empty());
    }

    #[test]
    fn reposted_step_replaces_and_samples_attach_to_trace() {
        let store = fixture_store();
        must(ingest_run(&store, create_run("run-1", "pipeline")));

        let mut first = step_request("step-1", "run-1", StepType::Filter);
        first.output_summary = Some([("kept", json!(4))].into_iter().collect());
        first.samples = Some(vec![CandidateSample::new("P1").rejection_reason("low_rating")]);
        must(ingest_step(&store, first));

        let mut second = step_request("step-1", "run-1", StepType::Filter);
        second.output_summary = Some([("kept", json!(2))].into_iter().collect());
        second.samples = Some(vec![CandidateSample::new("P2").decision("passed")]);
        must(ingest_step(&store, second));

        let trace = must(get_run_trace(&store, &RunId::from("run-1")));
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].step.output_summary.number("kept"), Some(2.0));
        let candidates: Vec<&str> = trace.steps[0]
            .samples
            .iter()
            .map(|sample| sample.candidate_id.as_str())
            .collect();
        assert_eq!(candidates, vec!["P1", "P2"]);
    }

    #[test]
    fn filter_events_above_applies_threshold_and_missing_default() {
        let store = fixture_store();
        must(ingest_step(&store, filter_step("high", Some(json!(0.9)))));
        must(ingest_step(&store, filter_step("mid", Some(json!(0.5)))));
        must(ingest_step(&store, filter_step("none", None)));
        must(ingest_step(&store, filter_step("text", Some(json!("0.95")))));

        let mut not_a_filter = step_request("rank", "run-1", StepType::Rank);
        not_a_filter.metrics = Some([(keys::FILTERED_RATIO, json!(0.99))].into_iter().collect());
        must(ingest_step(&store, not_a_filter));

        let results = must(filter_events_above(&store, DEFAULT_RATIO_GT));
        assert_eq!(result_ids(&results), vec!["high"]);

        let everything_positive = must(filter_events_above(&store, 0.0));
        assert_eq!(result_ids(&everything_positive), vec!["high", "mid"]);
    }

    #[test]
    fn weak_filters_below_treats_missing_ratio_as_one() {
        let store = fixture_store();
        must(ingest_step(&store, filter_step("weak", Some(json!(0.1)))));
        must(ingest_step(&store, filter_step("strong", Some(json!(0.7)))));
        must(ingest_step(&store, filter_step("none", None)));

        let results = must(weak_filters_below(&store, DEFAULT_RATIO_LT));
        assert_eq!(result_ids(&results), vec!["weak"]);

        let lenient = must(weak_filters_below(&store, 1.5));
        assert_eq!(result_ids(&lenient), vec!["weak", "strong", "none"]);
    }

    #[test]
    fn query_failures_matches_mode_and_joins_run_fields() {
        let store = fixture_store();
        must(ingest_run(&store, create_run("run-1", "competitor_match_pipeline")));
        must(ingest_step(&store, failure_step("s1", "run-1", json!("llm_keyword_drift"))));
        must(ingest_step(&store, failure_step("s2", "run-1", json!("over_aggressive_filter"))));
        must(ingest_step(&store, step_request("s3", "run-1", StepType::Filter)));

        let report = must(query_failures(&store, Some("llm_keyword_drift")));
        assert_eq!(report.count, 1);
        let row = &report.results[0];
        assert_eq!(row.failure_mode, "llm_keyword_drift");
        assert_eq!(row.pipeline_name, "competitor_match_pipeline");
        assert_eq!(row.run_id, RunId::from("run-1"));
        assert_eq!(row.step_name, "llm_s1");

        assert_eq!(must(query_failures(&store, None)).count, 2);
        assert_eq!(must(query_failures(&store, Some(""))).count, 2);
        assert_eq!(must(query_failures(&store, Some("unknown"))).count, 0);
    }

    #[test]
    fn query_failures_skips_orphans_and_null_labels() {
        let store = fixture_store();
        must(ingest_run(&store, create_run("run-1", "pipeline")));
        must(ingest_step(&store, failure_step("orphan", "no-run", json!("llm_keyword_drift"))));
        must(ingest_step(&store, failure_step("null", "run-1", Value::Null)));
        must(ingest_step(&store, failure_step("coded", "run-1", json!(42))));

        let report = must(query_failures(&store, None));
        assert_eq!(report.count, 1);
        assert_eq!(report.results[0].failure_mode, "42");
    }

    #[test]
    fn list_recent_runs_summarizes_newest_first() {
        let store = fixture_store();
        for id in ["a", "b", "c"] {
            must(ingest_run(&store, create_run(id, "pipeline")));
        }
        let listing = must(list_recent_runs(&store, 2));
        let ids: Vec<&str> = listing.results.iter().map(|run| run.run_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn queries_never_create_a_missing_database() {
        let path = std::env::temp_dir().join(format!("xray-trace-api-{}.sqlite3", ulid::Ulid::new()));
        let api = TraceApi::new(&path);
        assert!(api.get_run_trace(&RunId::from("run-1")).is_err());
        assert!(api.list_recent_runs(DEFAULT_RECENT_RUNS).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn trace_api_opens_file_database_per_call() {
        let path = std::env::temp_dir().join(format!("xray-trace-api-{}.sqlite3", ulid::Ulid::new()));
        let api = TraceApi::new(&path);
        must(api.migrate());
        must(api.ingest_run(create_run("run-1", "smoke_test")));
        must(api.ingest_step(filter_step("s1", Some(json!(0.66)))));
        must(api.end_run(RunEndRequest {
            run_id: "run-1".to_string(),
            outcome_summary: Some([("result", json!("done"))].into_iter().collect()),
            ended_at: None,
        }));

        let trace = must(api.get_run_trace(&RunId::from("run-1")));
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(
            trace.run.as_ref().and_then(|run| run.outcome_summary.text("result")),
            Some("done")
        );

        let _ = std::fs::remove_file(&path);
    }
}

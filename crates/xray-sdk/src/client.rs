use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use xray_trace_domain::{
    format_timestamp, keys, now_utc, CandidateSample, RunId, RunIngestRequest, StepId,
    StepIngestRequest, StepType, StructuredMap, DEFAULT_MAX_SAMPLES,
};

use crate::transport::{DeliveryOutcome, Transport, DEFAULT_TIMEOUT};

const RUN_PATH: &str = "/ingest/run";
const STEP_PATH: &str = "/ingest/step";

/// How verbosely the caller intends to sample. Carried in each step's context;
/// the backend does not enforce it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureMode {
    Summary,
    #[default]
    Sample,
    Full,
}

impl CaptureMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Sample => "sample",
            Self::Full => "full",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "summary" => Some(Self::Summary),
            "sample" => Some(Self::Sample),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub timeout: Duration,
    pub capture_mode: CaptureMode,
}

impl ClientConfig {
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            timeout: DEFAULT_TIMEOUT,
            capture_mode: CaptureMode::default(),
        }
    }
}

/// Entry point for instrumented pipelines.
///
/// Every call blocks for at most one delivery round trip and never returns an
/// error; delivery problems only disable the underlying [`Transport`].
#[derive(Debug, Clone)]
pub struct TraceClient {
    transport: Arc<Transport>,
    capture_mode: CaptureMode,
}

impl TraceClient {
    /// Client with its own HTTP transport and default settings.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(api_url))
    }

    #[must_use]
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(Transport::http(&config.api_url, config.timeout)),
            capture_mode: config.capture_mode,
        }
    }

    /// Client over an existing transport. Clients built from the same `Arc`
    /// share one breaker.
    #[must_use]
    pub fn with_transport(transport: Arc<Transport>, capture_mode: CaptureMode) -> Self {
        Self {
            transport,
            capture_mode,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    #[must_use]
    pub fn capture_mode(&self) -> CaptureMode {
        self.capture_mode
    }

    /// Record the start of a run and return its fresh identifier.
    pub fn start_run(
        &self,
        pipeline_name: &str,
        input_summary: StructuredMap,
        metadata: StructuredMap,
    ) -> RunId {
        let run_id = RunId::generate();
        self.post(RUN_PATH, || {
            encode(&RunIngestRequest {
                run_id: run_id.0.clone(),
                pipeline_name: Some(pipeline_name.to_string()),
                input_summary: Some(input_summary),
                outcome_summary: Some(StructuredMap::new()),
                started_at: Some(timestamp_now()?),
                ended_at: None,
                metadata: Some(metadata),
            })
        });
        run_id
    }

    /// Record the outcome of a run. Only `run_id`, `outcome_summary` and
    /// `ended_at` are sent; the stored creation fields are left alone.
    pub fn end_run(&self, run_id: &RunId, outcome_summary: StructuredMap) -> DeliveryOutcome {
        self.post(RUN_PATH, || {
            encode(&RunIngestRequest {
                run_id: run_id.0.clone(),
                pipeline_name: None,
                input_summary: None,
                outcome_summary: Some(outcome_summary),
                started_at: None,
                ended_at: Some(timestamp_now()?),
                metadata: None,
            })
        })
    }

    /// Open a step capped at [`DEFAULT_MAX_SAMPLES`] samples. The step is
    /// sent once when the returned guard goes out of scope.
    pub fn step(
        &self,
        run_id: &RunId,
        step_name: &str,
        step_type: StepType,
        input_summary: StructuredMap,
    ) -> StepGuard<'_> {
        self.step_with_max_samples(run_id, step_name, step_type, input_summary, DEFAULT_MAX_SAMPLES)
    }

    pub fn step_with_max_samples(
        &self,
        run_id: &RunId,
        step_name: &str,
        step_type: StepType,
        input_summary: StructuredMap,
        max_samples: usize,
    ) -> StepGuard<'_> {
        let mut context = StructuredMap::new();
        context.insert(keys::CAPTURE_MODE, self.capture_mode.as_str());

        StepGuard {
            client: self,
            step_id: StepId::generate(),
            run_id: run_id.clone(),
            step_name: step_name.to_string(),
            step_type,
            input_summary,
            output_summary: StructuredMap::new(),
            metrics: StructuredMap::new(),
            reasoning: None,
            context,
            samples: Vec::new(),
            max_samples,
            started: Instant::now(),
            flushed: false,
        }
    }

    /// Run `body` inside a step. The step is flushed when `body` returns or
    /// unwinds.
    pub fn with_step<T>(
        &self,
        run_id: &RunId,
        step_name: &str,
        step_type: StepType,
        input_summary: StructuredMap,
        body: impl FnOnce(&mut StepGuard<'_>) -> T,
    ) -> T {
        let mut guard = self.step(run_id, step_name, step_type, input_summary);
        body(&mut guard)
    }

    fn post<F>(&self, path: &str, build: F) -> DeliveryOutcome
    where
        F: FnOnce() -> Result<Value>,
    {
        if !self.transport.is_enabled() {
            return DeliveryOutcome::Skipped;
        }
        match build() {
            Ok(payload) => self.transport.send(path, &payload),
            Err(err) => {
                tracing::warn!(path, error = %format!("{err:#}"), "dropping unencodable trace event");
                DeliveryOutcome::Skipped
            }
        }
    }
}

/// Accumulates one step's state until it is dropped or finished.
#[derive(Debug)]
pub struct StepGuard<'a> {
    client: &'a TraceClient,
    step_id: StepId,
    run_id: RunId,
    step_name: String,
    step_type: StepType,
    input_summary: StructuredMap,
    output_summary: StructuredMap,
    metrics: StructuredMap,
    reasoning: Option<String>,
    context: StructuredMap,
    samples: Vec<CandidateSample>,
    max_samples: usize,
    started: Instant,
    flushed: bool,
}

impl StepGuard<'_> {
    #[must_use]
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Replace the step output.
    pub fn log_output(&mut self, output: StructuredMap) {
        self.output_summary = output;
    }

    pub fn log_metric(&mut self, key: &str, value: impl Into<Value>) {
        self.metrics.insert(key, value);
    }

    /// Merge into the metrics map; existing keys not in `metrics` are kept.
    pub fn log_metrics(&mut self, metrics: StructuredMap) {
        self.metrics.merge(metrics);
    }

    pub fn log_reasoning(&mut self, text: impl Into<String>) {
        self.reasoning = Some(text.into());
    }

    /// Merge into the context map.
    pub fn log_context(&mut self, context: StructuredMap) {
        self.context.merge(context);
    }

    /// Append a sample unless the cap is reached. Returns whether it was kept.
    pub fn log_sample(&mut self, sample: CandidateSample) -> bool {
        if self.samples.len() >= self.max_samples {
            return false;
        }
        self.samples.push(sample);
        true
    }

    /// Flush now instead of at end of scope.
    pub fn finish(mut self) -> DeliveryOutcome {
        self.flush()
    }

    fn flush(&mut self) -> DeliveryOutcome {
        if self.flushed {
            return DeliveryOutcome::Skipped;
        }
        self.flushed = true;

        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .insert(keys::LATENCY_MS, (elapsed_ms * 100.0).round() / 100.0);

        let request = StepIngestRequest {
            step_id: self.step_id.0.clone(),
            run_id: self.run_id.0.clone(),
            step_name: std::mem::take(&mut self.step_name),
            step_type: self.step_type.clone(),
            input_summary: Some(std::mem::take(&mut self.input_summary)),
            output_summary: Some(std::mem::take(&mut self.output_summary)),
            metrics: Some(std::mem::take(&mut self.metrics)),
            reasoning: self.reasoning.take(),
            context: Some(std::mem::take(&mut self.context)),
            created_at: String::new(),
            samples: Some(std::mem::take(&mut self.samples)),
        };

        self.client.post(STEP_PATH, move || {
            let mut request = request;
            request.created_at = timestamp_now()?;
            encode(&request)
        })
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

fn timestamp_now() -> Result<String> {
    Ok(format_timestamp(now_utc())?)
}

fn encode<T: serde::Serialize>(payload: &T) -> Result<Value> {
    serde_json::to_value(payload).context("failed to encode trace payload")
}

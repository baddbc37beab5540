#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

pub const DEFAULT_MAX_SAMPLES: usize = 50;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TraceError {
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Well-known keys inside step `metrics` and `context` maps.
pub mod keys {
    pub const FILTERED_RATIO: &str = "filtered_ratio";
    pub const FAILURE_MODE: &str = "failure_mode";
    pub const LATENCY_MS: &str = "latency_ms";
    pub const CAPTURE_MODE: &str = "capture_mode";
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Step category. The vocabulary is open: unknown labels round-trip through
/// [`StepType::Other`] untouched so they stay queryable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Llm,
    Retrieval,
    Filter,
    Validation,
    Rank,
    Other(String),
}

impl StepType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Llm => "llm",
            Self::Retrieval => "retrieval",
            Self::Filter => "filter",
            Self::Validation => "validation",
            Self::Rank => "rank",
            Self::Other(value) => value,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "llm" => Self::Llm,
            "retrieval" => Self::Retrieval,
            "filter" => Self::Filter,
            "validation" => Self::Validation,
            "rank" => Self::Rank,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semi-structured key/value map attached to runs and steps.
///
/// Persisted as an opaque JSON blob; predicates over sub-keys are evaluated
/// after deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct StructuredMap(Map<String, Value>);

impl StructuredMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Numeric value under `key`; non-numeric values read as absent.
    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Shallow merge: keys in `other` overwrite keys here, others are kept.
    pub fn merge(&mut self, other: StructuredMap) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// # Errors
    /// Returns an error if a value cannot be serialized.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// Decode a stored blob. Empty text and JSON `null` decode to an empty map.
    ///
    /// # Errors
    /// Returns an error if the text is not a JSON object.
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Option<Map<String, Value>> = serde_json::from_str(raw)?;
        Ok(Self(value.unwrap_or_default()))
    }
}

impl From<Map<String, Value>> for StructuredMap {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for StructuredMap {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub input_summary: StructuredMap,
    pub outcome_summary: StructuredMap,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
    pub metadata: StructuredMap,
}

/// The only fields an existing run accepts after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub run_id: RunId,
    pub outcome_summary: StructuredMap,
    pub ended_at: Option<DateTimeUtc>,
}

impl RunRecord {
    #[must_use]
    pub fn as_update(&self) -> RunUpdate {
        RunUpdate {
            run_id: self.run_id.clone(),
            outcome_summary: self.outcome_summary.clone(),
            ended_at: self.ended_at,
        }
    }
}

/// Apply an end-update to a stored run.
///
/// Only `outcome_summary` and `ended_at` are taken from `update`; the identity,
/// pipeline name, input summary, start time and metadata always come from
/// `existing`.
#[must_use]
pub fn merge_run(existing: &RunRecord, update: &RunUpdate) -> RunRecord {
    RunRecord {
        run_id: existing.run_id.clone(),
        pipeline_name: existing.pipeline_name.clone(),
        input_summary: existing.input_summary.clone(),
        outcome_summary: update.outcome_summary.clone(),
        started_at: existing.started_at,
        ended_at: update.ended_at,
        metadata: existing.metadata.clone(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: StepId,
    pub run_id: RunId,
    pub step_name: String,
    pub step_type: StepType,
    pub input_summary: StructuredMap,
    pub output_summary: StructuredMap,
    pub metrics: StructuredMap,
    pub reasoning: Option<String>,
    pub context: StructuredMap,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateSample {
    pub candidate_id: String,
    #[serde(default)]
    pub attributes: StructuredMap,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl CandidateSample {
    #[must_use]
    pub fn new(candidate_id: impl Into<String>) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            attributes: StructuredMap::default(),
            decision: None,
            score: None,
            rejection_reason: None,
        }
    }

    #[must_use]
    pub fn attributes(mut self, attributes: StructuredMap) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.decision = Some(decision.into());
        self
    }

    #[must_use]
    pub fn score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    #[must_use]
    pub fn rejection_reason(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunIngestRequest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_summary: Option<StructuredMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_summary: Option<StructuredMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StructuredMap>,
}

/// What a run ingestion payload asks the store to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RunWrite {
    Upsert(RunRecord),
    End(RunUpdate),
}

impl RunIngestRequest {
    /// Classify and validate the payload.
    ///
    /// A payload naming neither `pipeline_name` nor `started_at` is an
    /// end-update. Anything else is a create (or a merge into an existing
    /// run) and must carry both.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] for empty identifiers, a create
    /// missing one of its required fields, or malformed timestamps.
    pub fn into_write(self, now: DateTimeUtc) -> Result<RunWrite, TraceError> {
        ensure_non_empty("run_id", &self.run_id)?;
        let pipeline_name = non_empty(self.pipeline_name);
        let started_at = non_empty(self.started_at);
        let ended_at = non_empty(self.ended_at)
            .map(|raw| parse_timestamp("ended_at", &raw))
            .transpose()?;

        let (pipeline_name, started_raw) = match (pipeline_name, started_at) {
            (None, None) => {
                return Ok(RunWrite::End(RunUpdate {
                    run_id: RunId(self.run_id),
                    outcome_summary: self.outcome_summary.unwrap_or_default(),
                    ended_at: Some(ended_at.unwrap_or(now)),
                }));
            }
            (Some(pipeline_name), Some(started_raw)) => (pipeline_name, started_raw),
            (None, Some(_)) => {
                return Err(TraceError::Validation(
                    "pipeline_name must be provided when creating a run".into(),
                ));
            }
            (Some(_), None) => {
                return Err(TraceError::Validation(
                    "started_at must be provided when creating a run".into(),
                ));
            }
        };

        Ok(RunWrite::Upsert(RunRecord {
            run_id: RunId(self.run_id),
            pipeline_name,
            input_summary: self.input_summary.unwrap_or_default(),
            outcome_summary: self.outcome_summary.unwrap_or_default(),
            started_at: parse_timestamp("started_at", &started_raw)?,
            ended_at,
            metadata: self.metadata.unwrap_or_default(),
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEndRequest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_summary: Option<StructuredMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl RunEndRequest {
    /// # Errors
    /// Returns [`TraceError::Validation`] for an empty `run_id` or a malformed
    /// `ended_at`.
    pub fn into_update(self, now: DateTimeUtc) -> Result<RunUpdate, TraceError> {
        ensure_non_empty("run_id", &self.run_id)?;
        let ended_at = non_empty(self.ended_at)
            .map(|raw| parse_timestamp("ended_at", &raw))
            .transpose()?
            .unwrap_or(now);
        Ok(RunUpdate {
            run_id: RunId(self.run_id),
            outcome_summary: self.outcome_summary.unwrap_or_default(),
            ended_at: Some(ended_at),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepIngestRequest {
    pub step_id: String,
    pub run_id: String,
    pub step_name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub input_summary: Option<StructuredMap>,
    #[serde(default)]
    pub output_summary: Option<StructuredMap>,
    #[serde(default)]
    pub metrics: Option<StructuredMap>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub context: Option<StructuredMap>,
    pub created_at: String,
    #[serde(default)]
    pub samples: Option<Vec<CandidateSample>>,
}

impl StepIngestRequest {
    /// Split the payload into the step row and its samples.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] for empty identifiers, an empty
    /// `step_type`, a sample without `candidate_id`, or a malformed
    /// `created_at`.
    pub fn into_parts(self) -> Result<(StepRecord, Vec<CandidateSample>), TraceError> {
        ensure_non_empty("step_id", &self.step_id)?;
        ensure_non_empty("run_id", &self.run_id)?;
        ensure_non_empty("step_name", &self.step_name)?;
        ensure_non_empty("step_type", self.step_type.as_str())?;
        let created_at = parse_timestamp("created_at", &self.created_at)?;

        let samples = self.samples.unwrap_or_default();
        for (index, sample) in samples.iter().enumerate() {
            if sample.candidate_id.trim().is_empty() {
                return Err(TraceError::Validation(format!(
                    "samples[{index}].candidate_id cannot be empty"
                )));
            }
        }

        let step = StepRecord {
            step_id: StepId(self.step_id),
            run_id: RunId(self.run_id),
            step_name: self.step_name,
            step_type: self.step_type,
            input_summary: self.input_summary.unwrap_or_default(),
            output_summary: self.output_summary.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            reasoning: self.reasoning,
            context: self.context.unwrap_or_default(),
            created_at,
        };
        Ok((step, samples))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestAck {
    pub status: String,
}

impl IngestAck {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceStep {
    #[serde(flatten)]
    pub step: StepRecord,
    pub samples: Vec<CandidateSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunTrace {
    pub run: Option<RunRecord>,
    pub steps: Vec<TraceStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResults {
    pub results: Vec<StepRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRow {
    pub run_id: RunId,
    pub step_name: String,
    pub step_type: StepType,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    pub pipeline_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    pub failure_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReport {
    pub count: usize,
    pub results: Vec<FailureRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id.clone(),
            pipeline_name: run.pipeline_name.clone(),
            started_at: run.started_at,
            ended_at: run.ended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunListing {
    pub results: Vec<RunSummary>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Parse an ISO-8601 timestamp and normalize it to UTC.
///
/// Accepts RFC 3339 with any offset, or a naive `YYYY-MM-DDTHH:MM:SS[.f]`
/// value which is read as UTC.
///
/// # Errors
/// Returns [`TraceError::Validation`] naming `field` when neither form parses.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTimeUtc, TraceError> {
    let raw = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    let naive = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );
    PrimitiveDateTime::parse(raw, naive)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| TraceError::Validation(format!("{field} is not an ISO-8601 timestamp: {err}")))
}

/// # Errors
/// Returns [`TraceError::Validation`] when formatting fails.
pub fn format_timestamp(value: DateTimeUtc) -> Result<String, TraceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| TraceError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`TraceError::Validation`] when the value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), TraceError> {
    if value.trim().is_empty() {
        return Err(TraceError::Validation(format!("{field_name} cannot be empty")));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|raw| !raw.trim().is_empty())
}

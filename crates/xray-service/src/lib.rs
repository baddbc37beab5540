#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use xray_trace_api::{TraceApi, DEFAULT_RATIO_GT, DEFAULT_RATIO_LT, DEFAULT_RECENT_RUNS};
use xray_trace_domain::{
    FailureReport, IngestAck, RunEndRequest, RunId, RunIngestRequest, RunListing, RunTrace,
    StepIngestRequest, StepResults, TraceError,
};

pub const SERVICE_CONTRACT_VERSION: &str = "xray.v1";

#[derive(Debug, Clone)]
pub struct ServiceState {
    api: TraceApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    invalid_query_total: AtomicU64,
    validation_error_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    invalid_query_total: u64,
    validation_error_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilterEventsParams {
    ratio_gt: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WeakFiltersParams {
    ratio_lt: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FailuresParams {
    mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RecentRunsParams {
    limit: Option<usize>,
}

impl ServiceFailure {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    #[must_use]
    pub fn new(api: TraceApi, operation_timeout: Duration) -> Self {
        Self {
            api,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure("invalid_json", false);
        tracing::warn!(code = "invalid_json", error = %rejection, "rejected request body");
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure("invalid_query", false);
        tracing::warn!(code = "invalid_query", error = %rejection, "rejected query string");
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_query",
            rejection.body_text(),
            None,
        )
    }

    fn classify_api_error(err: &anyhow::Error) -> ServiceFailure {
        if let Some(TraceError::Validation(message)) = err.downcast_ref::<TraceError>() {
            return Self::failure(
                StatusCode::BAD_REQUEST,
                "validation_error",
                message.clone(),
                None,
            );
        }

        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();
        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("schema")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                message,
                None,
            );
        }

        Self::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
            None,
        )
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(TraceApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                tracing::warn!(operation = operation_label, code = "timeout", "operation timed out");
                Self::failure(
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err);
                self.telemetry.record_failure(failure.code, false);
                tracing::warn!(
                    operation = operation_label,
                    code = failure.code,
                    error = %format!("{err:#}"),
                    "request failed"
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "invalid_query" => &self.invalid_query_total,
            "validation_error" => &self.validation_error_total,
            "storage_unavailable" => &self.storage_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            invalid_query_total: self.invalid_query_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

pub fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ingest/run", post(ingest_run))
        .route("/ingest/step", post(ingest_step))
        .route("/ingest/run/end", post(end_run))
        .route("/query/run/:run_id", get(run_trace))
        .route("/query/filter-events", get(filter_events))
        .route("/query/weak-filters", get(weak_filters))
        .route("/query/failures", get(failures))
        .route("/query/runs", get(recent_runs))
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ingest_run(
    State(state): State<ServiceState>,
    payload: Result<Json<RunIngestRequest>, JsonRejection>,
) -> Result<Json<IngestAck>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let ack = state
        .run_blocking("ingest_run", move |api| api.ingest_run(request))
        .await?;
    Ok(Json(ack))
}

async fn ingest_step(
    State(state): State<ServiceState>,
    payload: Result<Json<StepIngestRequest>, JsonRejection>,
) -> Result<Json<IngestAck>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let ack = state
        .run_blocking("ingest_step", move |api| api.ingest_step(request))
        .await?;
    Ok(Json(ack))
}

async fn end_run(
    State(state): State<ServiceState>,
    payload: Result<Json<RunEndRequest>, JsonRejection>,
) -> Result<Json<IngestAck>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let ack = state
        .run_blocking("end_run", move |api| api.end_run(request))
        .await?;
    Ok(Json(ack))
}

async fn run_trace(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunTrace>, ServiceFailure> {
    let trace = state
        .run_blocking("run_trace", move |api| api.get_run_trace(&RunId(run_id)))
        .await?;
    Ok(Json(trace))
}

async fn filter_events(
    State(state): State<ServiceState>,
    params: Result<Query<FilterEventsParams>, QueryRejection>,
) -> Result<Json<StepResults>, ServiceFailure> {
    let Query(params) =
        params.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let threshold = params.ratio_gt.unwrap_or(DEFAULT_RATIO_GT);
    let results = state
        .run_blocking("filter_events", move |api| api.filter_events_above(threshold))
        .await?;
    Ok(Json(results))
}

async fn weak_filters(
    State(state): State<ServiceState>,
    params: Result<Query<WeakFiltersParams>, QueryRejection>,
) -> Result<Json<StepResults>, ServiceFailure> {
    let Query(params) =
        params.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let threshold = params.ratio_lt.unwrap_or(DEFAULT_RATIO_LT);
    let results = state
        .run_blocking("weak_filters", move |api| api.weak_filters_below(threshold))
        .await?;
    Ok(Json(results))
}

async fn failures(
    State(state): State<ServiceState>,
    params: Result<Query<FailuresParams>, QueryRejection>,
) -> Result<Json<FailureReport>, ServiceFailure> {
    let Query(params) =
        params.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let report = state
        .run_blocking("failures", move |api| api.query_failures(params.mode.as_deref()))
        .await?;
    Ok(Json(report))
}

async fn recent_runs(
    State(state): State<ServiceState>,
    params: Result<Query<RecentRunsParams>, QueryRejection>,
) -> Result<Json<RunListing>, ServiceFailure> {
    let Query(params) =
        params.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let limit = params.limit.unwrap_or(DEFAULT_RECENT_RUNS);
    let listing = state
        .run_blocking("recent_runs", move |api| api.list_recent_runs(limit))
        .await?;
    Ok(Json(listing))
}

//! HTTP API: health checks, Prometheus metrics and the engine query surface

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use engine_lib::{
    aggregation::AggregationRequest,
    alerting::{RuleFile, RuleSet, RuleSetError},
    anomaly::AnomalyQuery,
    health::ComponentStatus,
    AnomalyEvent, EngineError, MetricSample, MetricsEngine, SampleSender,
    TrafficFlowCorrelation,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MetricsEngine>,
    /// Buffered ingest path; samples are applied inline when absent
    pub samples: Option<SampleSender>,
}

impl AppState {
    pub fn new(engine: Arc<MetricsEngine>) -> Self {
        Self {
            engine,
            samples: None,
        }
    }

    pub fn with_sample_sender(mut self, samples: SampleSender) -> Self {
        self.samples = Some(samples);
        self
    }
}

/// Error body: `{"error": "...", "details": [...]}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    details: Vec<serde_json::Value>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn with_details(mut self, details: Vec<serde_json::Value>) -> Self {
        self.details = details;
        self
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Rules(RuleSetError::Invalid(errors)) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message: "rule set rejected".to_string(),
                details: errors.iter().map(|e| json!(e)).collect(),
            },
            EngineError::Rules(RuleSetError::Source { .. }) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message,
                details: Vec::new(),
            },
            EngineError::InvalidAggregation(_) | EngineError::InvalidSample(_) => {
                Self::bad_request(message)
            }
            EngineError::IngestBackpressure => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message,
                details: Vec::new(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "details": self.details,
        }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.engine.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.engine.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SampleBatch {
    Many(Vec<MetricSample>),
    One(MetricSample),
}

#[derive(Debug, Serialize)]
struct RejectedSample {
    index: usize,
    error: String,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: usize,
    /// True when samples were queued rather than applied inline
    queued: bool,
    rejected: Vec<RejectedSample>,
    anomalies: Vec<AnomalyEvent>,
}

async fn ingest_samples(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<SampleBatch>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let samples = match batch {
        SampleBatch::Many(samples) => samples,
        SampleBatch::One(sample) => vec![sample],
    };

    let mut response = IngestResponse {
        accepted: 0,
        queued: state.samples.is_some(),
        rejected: Vec::new(),
        anomalies: Vec::new(),
    };

    for (index, sample) in samples.into_iter().enumerate() {
        let result = match &state.samples {
            Some(sender) => sender.try_send(sample).map(|()| None),
            None => state.engine.ingest(sample),
        };
        match result {
            Ok(anomaly) => {
                response.accepted += 1;
                response.anomalies.extend(anomaly);
            }
            Err(EngineError::IngestBackpressure) => {
                return Err(ApiError::from(EngineError::IngestBackpressure)
                    .with_details(vec![json!({ "accepted": response.accepted })]));
            }
            Err(e) => response.rejected.push(RejectedSample {
                index,
                error: e.to_string(),
            }),
        }
    }

    if response.accepted == 0 && !response.rejected.is_empty() {
        let details = response.rejected.iter().map(|r| json!(r)).collect();
        return Err(ApiError::bad_request("no valid samples").with_details(details));
    }

    let status = if response.queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

async fn list_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomalyQuery>,
) -> Json<Vec<AnomalyEvent>> {
    Json(state.engine.get_anomalies(&query))
}

#[derive(Debug, Serialize)]
struct FlowsResponse {
    computed_at: Option<DateTime<Utc>>,
    flows: Vec<TrafficFlowCorrelation>,
}

async fn list_flows(State(state): State<Arc<AppState>>) -> Json<FlowsResponse> {
    let snapshot = state.engine.flow_snapshot();
    Json(FlowsResponse {
        computed_at: snapshot.computed_at,
        flows: snapshot.flows.clone(),
    })
}

async fn aggregate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AggregationRequest>,
) -> ApiResult<impl IntoResponse> {
    let result = state.engine.compute_aggregation(&request)?;
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
struct AlertsQuery {
    /// Include every tracked state, not just firing ones
    #[serde(default)]
    all: bool,
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Response {
    if query.all {
        Json(state.engine.alert_states()).into_response()
    } else {
        Json(state.engine.get_active_alerts()).into_response()
    }
}

#[derive(Debug, Serialize)]
struct RuleView {
    name: String,
    metric: String,
    condition: String,
    threshold: f64,
    evaluation_interval_secs: u64,
    consecutive_required: u32,
    message_template: String,
}

#[derive(Debug, Serialize)]
struct RulesResponse {
    version: u64,
    loaded_at: DateTime<Utc>,
    rules: Vec<RuleView>,
}

impl From<&RuleSet> for RulesResponse {
    fn from(set: &RuleSet) -> Self {
        Self {
            version: set.version(),
            loaded_at: set.loaded_at(),
            rules: set
                .rules()
                .iter()
                .map(|r| RuleView {
                    name: r.name.clone(),
                    metric: r.metric.clone(),
                    condition: r.condition.to_string(),
                    threshold: r.threshold,
                    evaluation_interval_secs: r.evaluation_interval.as_secs(),
                    consecutive_required: r.consecutive_required,
                    message_template: r.message_template.clone(),
                })
                .collect(),
        }
    }
}

async fn list_rules(State(state): State<Arc<AppState>>) -> Json<RulesResponse> {
    let rules = state.engine.rule_engine().rules();
    Json(RulesResponse::from(rules.as_ref()))
}

/// Reload rules. An empty body re-reads the rule file; a JSON body
/// `{"rules": [...]}` replaces the set with its contents.
async fn reload_rules(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<RulesResponse>> {
    let set = if body.iter().all(u8::is_ascii_whitespace) {
        state.engine.reload_rules_from_file()?
    } else {
        let file: RuleFile = serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid rule payload: {e}")))?;
        state.engine.reload_rules(&file.rules)?
    };
    Ok(Json(RulesResponse::from(set.as_ref())))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.status())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/samples", post(ingest_samples))
        .route("/api/v1/anomalies", get(list_anomalies))
        .route("/api/v1/flows", get(list_flows))
        .route("/api/v1/aggregate", post(aggregate))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/rules", get(list_rules))
        .route("/api/v1/rules/reload", post(reload_rules))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

/// Start the API server; stops accepting connections on shutdown
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

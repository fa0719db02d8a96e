//! HTTP surface
//!
//! Thin axum layer over [`SimulationEngine`]: request parsing, error to
//! status mapping, and the server-sent-events push stream.

use crate::engine::SimulationEngine;
use crate::error::SimError;
use crate::hub::{PushEvent, SessionData};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use netdrill_common::{LinkMetrics, RawSample, Role};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Default history window, 15 minutes
const DEFAULT_HISTORY_SECONDS: u64 = 900;
const DEFAULT_REPORT_SECONDS: u64 = 3600;

type AppState = Arc<SimulationEngine>;

impl IntoResponse for SimError {
    fn into_response(self) -> Response {
        let status = match &self {
            SimError::UnknownScenario(_) | SimError::CityNotFound(_) | SimError::LinkNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SimError::ScenarioAlreadyRunning(_) | SimError::NoCitiesAvailable => StatusCode::CONFLICT,
            SimError::InvalidMetrics(_) | SimError::TargetNotNeighbor { .. } => StatusCode::BAD_REQUEST,
            SimError::Config(_) | SimError::Serialization(_) | SimError::TimeSeries(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartScenarioRequest {
    #[serde(alias = "scenario_id")]
    pub scenario_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitStudentRequest {
    #[serde(alias = "student_id")]
    pub student_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(alias = "target_city_id")]
    pub target_city_id: String,
    #[serde(default)]
    pub message: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub role: Role,
    pub student_id: Option<String>,
    pub city_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

/// Build the API router
pub fn create_router(engine: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/network", get(network_state))
        .route("/api/v1/cities/:id", get(city_state))
        .route("/api/v1/cities/:id/neighbors", get(neighbors))
        .route("/api/v1/cities/:id/metrics", post(submit_metrics))
        .route("/api/v1/cities/:id/history", get(city_history))
        .route("/api/v1/cities/:id/hints", get(city_hints))
        .route("/api/v1/cities/:id/send", post(send_message))
        .route("/api/v1/links/:source/:target/metrics", post(update_link_metrics))
        .route("/api/v1/teacher/metrics", get(teacher_metrics))
        .route("/api/v1/report", get(network_report))
        .route("/api/v1/scenarios", get(list_scenarios))
        .route("/api/v1/scenarios/start", post(start_scenario))
        .route("/api/v1/scenarios/stop", post(stop_scenario))
        .route("/api/v1/scenarios/report", get(scenario_report))
        .route("/api/v1/alerts", get(alerts))
        .route("/api/v1/students/init", post(init_student))
        .route("/api/v1/stream", get(stream))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn health_check(State(engine): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "netdrill-engine",
        "scenarioRunning": engine.scheduler().is_running().await,
        "connections": engine.hub().connection_count(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn network_state(State(engine): State<AppState>) -> impl IntoResponse {
    Json(engine.network_state().await)
}

async fn city_state(State(engine): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, SimError> {
    Ok(Json(engine.city_state(&id).await?))
}

async fn neighbors(State(engine): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, SimError> {
    Ok(Json(serde_json::json!({ "neighbors": engine.neighbors(&id).await? })))
}

#[instrument(skip(engine, sample))]
async fn submit_metrics(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(sample): Json<RawSample>,
) -> Result<impl IntoResponse, SimError> {
    Ok(Json(engine.submit_metrics(&id, &sample).await?))
}

async fn city_history(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<impl IntoResponse, SimError> {
    let window = Duration::from_secs(query.window_seconds.unwrap_or(DEFAULT_HISTORY_SECONDS));
    Ok(Json(engine.city_history(&id, window)?))
}

async fn city_hints(State(engine): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, SimError> {
    Ok(Json(engine.city_hints(&id).await?))
}

#[instrument(skip(engine, request))]
async fn send_message(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, SimError> {
    let receipt = engine
        .transmit_message(&id, &request.target_city_id, &request.message)
        .await?;
    Ok(Json(receipt))
}

async fn update_link_metrics(
    State(engine): State<AppState>,
    Path((source, target)): Path<(String, String)>,
    Json(metrics): Json<LinkMetrics>,
) -> Result<impl IntoResponse, SimError> {
    Ok(Json(engine.update_link_metrics(&source, &target, metrics).await?))
}

async fn teacher_metrics(State(engine): State<AppState>) -> impl IntoResponse {
    Json(engine.teacher_metrics().await)
}

async fn network_report(State(engine): State<AppState>, Query(query): Query<WindowQuery>) -> impl IntoResponse {
    let window = Duration::from_secs(query.window_seconds.unwrap_or(DEFAULT_REPORT_SECONDS));
    Json(engine.network_report(window))
}

async fn list_scenarios(State(engine): State<AppState>) -> impl IntoResponse {
    Json(engine.scheduler().list_scenarios())
}

#[instrument(skip(engine))]
async fn start_scenario(
    State(engine): State<AppState>,
    Json(request): Json<StartScenarioRequest>,
) -> Result<impl IntoResponse, SimError> {
    Ok(Json(engine.scheduler().start(&request.scenario_id).await?))
}

async fn stop_scenario(State(engine): State<AppState>) -> Response {
    match engine.scheduler().stop().await {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn scenario_report(State(engine): State<AppState>) -> Response {
    match engine.scenario_report().await {
        Some(report) => Json(report).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn alerts(State(engine): State<AppState>, Query(query): Query<AlertsQuery>) -> impl IntoResponse {
    match query.limit {
        Some(limit) => Json(engine.hub().recent_alerts(limit).await),
        None => Json(engine.hub().alerts().await),
    }
}

#[instrument(skip(engine))]
async fn init_student(
    State(engine): State<AppState>,
    Json(request): Json<InitStudentRequest>,
) -> Result<impl IntoResponse, SimError> {
    Ok(Json(engine.init_student(&request.student_id).await?))
}

/// Removes the session once the client stream is dropped
struct SessionGuard {
    engine: AppState,
    connection_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let engine = self.engine.clone();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            engine.disconnect(connection_id).await;
        });
    }
}

fn to_sse(event: &PushEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn stream(
    State(engine): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, SimError> {
    let data = SessionData {
        student_id: query.student_id,
        city_id: query.city_id,
    };
    let (connection_id, rx) = engine.connect(query.role, data).await?;
    info!(connection_id = %connection_id, role = ?query.role, "Push stream opened");

    let guard = SessionGuard {
        engine: engine.clone(),
        connection_id,
    };
    let events = ReceiverStream::new(rx).map(move |event| {
        let _session = &guard;
        Ok(to_sse(&event))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = EngineConfig {
            simulation: crate::config::SimulationConfig {
                seed: Some(5),
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        create_router(Arc::new(SimulationEngine::new(config).unwrap()))
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_network() {
        let router = router();
        let (status, body) = call(&router, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = call(&router, "GET", "/api/v1/network", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cities"].as_array().unwrap().len(), 18);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let router = router();
        let (status, _) = call(&router, "GET", "/api/v1/cities/XXX", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &router,
            "POST",
            "/api/v1/scenarios/start",
            Some(serde_json::json!({ "scenarioId": "missing" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &router,
            "POST",
            "/api/v1/cities/PAR/send",
            Some(serde_json::json!({ "targetCityId": "SYD", "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "SYD is not a direct neighbor of PAR");

        let (status, _) = call(
            &router,
            "POST",
            "/api/v1/cities/PAR/metrics",
            Some(serde_json::json!({ "latencies": [10], "load": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_scenario_lifecycle() {
        let router = router();
        let (status, body) = call(&router, "GET", "/api/v1/scenarios", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().iter().any(|s| s["id"] == "normal"));

        let start = serde_json::json!({ "scenarioId": "normal" });
        let (status, _) = call(&router, "POST", "/api/v1/scenarios/start", Some(start.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&router, "POST", "/api/v1/scenarios/start", Some(start)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&router, "GET", "/api/v1/scenarios/report", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scenarioId"], "normal");

        let (status, _) = call(&router, "POST", "/api/v1/scenarios/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&router, "POST", "/api/v1/scenarios/stop", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_student_init_and_metrics() {
        let router = router();
        let (status, body) = call(
            &router,
            "POST",
            "/api/v1/students/init",
            Some(serde_json::json!({ "studentId": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cityId"], "PAR");

        let sample = serde_json::json!({
            "latencies": [80, 100, 120],
            "load": 85,
            "sent": 1000,
            "received": 950,
            "processed": 950,
            "bandwidthUsage": 50
        });
        let (status, body) = call(&router, "POST", "/api/v1/cities/PAR/metrics", Some(sample)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"]["metrics"]["averageLatency"], 100.0);
        assert_eq!(body["processed"]["anomalies"].as_array().unwrap().len(), 1);
        assert_eq!(body["feedback"].as_array().unwrap().len(), 1);

        let (status, body) = call(&router, "GET", "/api/v1/alerts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["message"], "high load detected");
    }
}

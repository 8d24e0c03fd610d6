use anyhow::{Context, Result};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post, put};
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::actuator::{Actuator, SettingsPatch, StatusUpdate};
use crate::arbiter::Arbiter;
use crate::clock;
use crate::dispense::{CombinedRequest, RunStarted, Sequencer, StopSummary};
use crate::dosing::{AutoDoser, Session, StartRequest};
use crate::error::HubError;
use crate::rules::{Rule, RuleDraft, RuleEngine};
use crate::sensors::Snapshot;
use crate::state::{self, SharedState, StatusResponse};

/// Blanket limit on any one request.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub arbiter: Arc<Arbiter>,
    pub rules: Arc<RuleEngine>,
    pub sequencer: Arc<Sequencer>,
    pub doser: Arc<AutoDoser>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_conflict() {
            StatusCode::CONFLICT
        } else {
            error!("web: request failed: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/readings/latest", get(latest_reading))
        // actuators
        .route("/api/actuators", get(list_actuators))
        .route("/api/actuators/reset", post(reset_actuators))
        .route("/api/actuators/{id}", get(get_actuator))
        .route("/api/actuators/{id}/remaining-time", get(remaining_time))
        .route("/api/actuators/{id}/status", put(set_status))
        .route("/api/actuators/{id}/settings", put(set_settings))
        .route("/api/actuators/{id}/toggle", post(toggle_actuator))
        // fertilizer
        .route("/api/fertilizer/combined", post(start_combined))
        .route("/api/fertilizer/combined/stop", post(stop_combined))
        .route("/api/fertilizer/auto-dose", post(start_auto_dose))
        .route("/api/fertilizer/auto-dose/stop", post(stop_auto_dose))
        .route("/api/fertilizer/auto-dose/status", get(auto_dose_status))
        // rules
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/check", post(check_rules))
        .route(
            "/api/rules/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/rules/{id}/toggle", patch(toggle_rule))
        .layer(middleware::from_fn_with_state(COMMAND_TIMEOUT, command_timeout))
        .with_state(app)
}

async fn command_timeout(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => {
            error!(%path, "web: request timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({ "error": "request timed out" })),
            )
                .into_response()
        }
    }
}

// -- status -----------------------------------------------------------------

#[derive(Serialize)]
struct HubStatus {
    #[serde(flatten)]
    system: StatusResponse,
    interlock_held: bool,
    dispensing: bool,
    auto_dosing: bool,
}

async fn api_status(State(app): State<AppState>) -> Json<HubStatus> {
    let system = app.shared.read().await.to_status();
    Json(HubStatus {
        system,
        interlock_held: app.arbiter.interlock_held().await,
        dispensing: app.sequencer.is_running().await,
        auto_dosing: app.doser.is_active().await,
    })
}

async fn latest_reading(State(app): State<AppState>) -> ApiResult<Option<Snapshot>> {
    let latest = state::latest_snapshot(&app.shared, app.arbiter.db())
        .await
        .map_err(HubError::from)?;
    Ok(Json(latest))
}

// -- actuators --------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReply {
    #[serde(flatten)]
    actuator: Actuator,
    vetoed: bool,
}

async fn list_actuators(State(app): State<AppState>) -> ApiResult<Vec<Actuator>> {
    Ok(Json(app.arbiter.list().await?))
}

async fn get_actuator(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Actuator> {
    Ok(Json(app.arbiter.get(&id).await?))
}

async fn remaining_time(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let secs = app.arbiter.remaining_time(&id).await?;
    Ok(Json(json!({ "id": id, "remainingTime": secs })))
}

async fn set_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<StatusReply> {
    let outcome = app.arbiter.set_status(&id, update).await?;
    Ok(Json(StatusReply {
        vetoed: outcome.is_vetoed(),
        actuator: outcome.actuator().clone(),
    }))
}

async fn set_settings(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Actuator> {
    Ok(Json(app.arbiter.set_settings(&id, patch).await?))
}

async fn toggle_actuator(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusReply> {
    let outcome = app.arbiter.toggle(&id).await?;
    Ok(Json(StatusReply {
        vetoed: outcome.is_vetoed(),
        actuator: outcome.actuator().clone(),
    }))
}

async fn reset_actuators(State(app): State<AppState>) -> ApiResult<Vec<Actuator>> {
    let all = app.arbiter.reset_all().await?;
    app.shared
        .write()
        .await
        .record_system(format!("actuators reset ({} recreated)", all.len()));
    Ok(Json(all))
}

// -- fertilizer -------------------------------------------------------------

async fn start_combined(
    State(app): State<AppState>,
    Json(req): Json<CombinedRequest>,
) -> ApiResult<RunStarted> {
    Ok(Json(app.sequencer.start(req).await?))
}

async fn stop_combined(State(app): State<AppState>) -> Json<StopSummary> {
    Json(app.sequencer.stop().await)
}

async fn start_auto_dose(
    State(app): State<AppState>,
    Json(req): Json<StartRequest>,
) -> ApiResult<Session> {
    Ok(Json(app.doser.start(req, clock::now()).await?))
}

async fn stop_auto_dose(State(app): State<AppState>) -> Json<serde_json::Value> {
    let was_active = app.doser.stop().await;
    Json(json!({ "stopped": was_active }))
}

async fn auto_dose_status(State(app): State<AppState>) -> Json<Session> {
    Json(app.doser.status(clock::now()).await)
}

// -- rules ------------------------------------------------------------------

async fn list_rules(State(app): State<AppState>) -> ApiResult<Vec<Rule>> {
    Ok(Json(app.rules.list().await?))
}

async fn create_rule(
    State(app): State<AppState>,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<Rule>), ApiError> {
    let rule = app.rules.create(draft).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Rule> {
    Ok(Json(app.rules.get(&id).await?))
}

async fn update_rule(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<Rule> {
    Ok(Json(app.rules.update(&id, draft).await?))
}

async fn delete_rule(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    app.rules.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_rule(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Rule> {
    Ok(Json(app.rules.toggle(&id).await?))
}

async fn check_rules(State(app): State<AppState>) -> ApiResult<serde_json::Value> {
    app.rules.check_now().await?;
    Ok(Json(json!({ "checked": true })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let router = router(app);

    #[cfg(feature = "tls")]
    {
        if let (Ok(cert), Ok(key)) = (env::var("TLS_CERT"), env::var("TLS_KEY")) {
            let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
                .await
                .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
            info!("web api listening on https://{addr}");
            axum_server::bind_rustls(addr, config)
                .serve(router.into_make_service())
                .await
                .context("web server error")?;
            return Ok(());
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;
    info!("web api listening on http://{addr}");
    axum::serve(listener, router)
        .await
        .context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

use crate::credentials::Credential;
use crate::errors::{AppError, ResultExt};
use crate::models::{SearchParams, SearchResult};
use crate::orchestrator::{CancelSignal, ProvidersStatus, SearchOptions, SearchOrchestrator};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// The search orchestrator; owns every provider's token/session state.
    pub orchestrator: Arc<SearchOrchestrator>,
}

/// Body of `POST /api/v1/search`: the search criteria, plus an optional
/// Provider A account to search with.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(flatten)]
    pub params: SearchParams,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub force_login: bool,
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "identity-search",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/search
///
/// Runs one multi-provider search. Provider failures never fail the request;
/// they show up in `flags` and `providers`. Returns 400 for unusable
/// criteria and 401 when the supplied Provider A account is rejected.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `body` - Search criteria and optional Provider A credentials.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResult>, AppError> {
    tracing::info!("POST /api/v1/search");

    let credential = match (body.username, body.password) {
        (None, None) => None,
        (Some(username), Some(password)) if !username.trim().is_empty() => {
            Some(Credential::new(username.trim(), password))
        }
        _ => {
            return Err(AppError::BadRequest(
                "username and password must be provided together".to_string(),
            ))
        }
    };

    let options = SearchOptions {
        credential,
        force_login: body.force_login,
    };

    let result = state
        .orchestrator
        .run(&body.params, &options, &CancelSignal::never())
        .await
        .context("identity search")?;

    if result.flags.is_partial() {
        tracing::info!(
            "Search returned {} record(s) with partial coverage: {:?}",
            result.records.len(),
            result.flags
        );
    }

    Ok(Json(result))
}

/// GET /api/v1/providers/status
///
/// Circuit-breaker state for Provider A and session state for the others.
pub async fn provider_status(State(state): State<Arc<AppState>>) -> Json<ProvidersStatus> {
    Json(state.orchestrator.status())
}

/// Routes under `/api/v1`, without state. `main` wraps them in the rate
/// limiter.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/search", post(search))
        .route("/api/v1/providers/status", get(provider_status))
}

/// Full router without middleware.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

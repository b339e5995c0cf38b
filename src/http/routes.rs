//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::app::AppState;
use crate::game::r#match::format_id;
use crate::game::JoinError;
use crate::store::maps::DEFAULT_MAP;
use crate::store::StoreError;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

const MAX_NAME_LEN: usize = 32;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Comma-separated origins in CLIENT_ORIGIN, anything goes when unset
    let cors = match &state.config.client_origin {
        Some(origins) => {
            let allowed_origins: Vec<header::HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE])
                .allow_credentials(true)
        }
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/maps", get(maps_handler))
        .route("/games", post(create_game_handler))
        .route("/games/:id/join", post(join_game_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.registry.active_matches(),
        active_players: state.registry.total_players(),
    })
}

// ============================================================================
// Map endpoints
// ============================================================================

#[derive(Serialize)]
struct MapsResponse {
    maps: Vec<String>,
}

async fn maps_handler(State(state): State<AppState>) -> Json<MapsResponse> {
    Json(MapsResponse {
        maps: state.maps.names(),
    })
}

// ============================================================================
// Game endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateGameRequest {
    creator: String,
    map: Option<String>,
}

#[derive(Serialize)]
struct GameResponse {
    game_id: String,
    id: u32,
    map: String,
}

async fn create_game_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateGameRequest>,
) -> Result<Json<GameResponse>, AppError> {
    let creator = validate_name(&req.creator)?;

    if let Some(existing) = state.registry.get_by_creator(creator) {
        return Ok(Json(GameResponse {
            game_id: format_id(existing.id),
            id: existing.id,
            map: existing.map_name,
        }));
    }

    let map_name = req.map.as_deref().unwrap_or(DEFAULT_MAP);
    let map = state.maps.get(map_name).await?;
    let handle = state
        .registry
        .create(creator, map_name, map)
        .ok_or(AppError::Unavailable("Too many games are running".to_string()))?;

    info!(match_id = %format_id(handle.id), creator, "Game created over HTTP");
    Ok(Json(GameResponse {
        game_id: format_id(handle.id),
        id: handle.id,
        map: handle.map_name,
    }))
}

#[derive(Deserialize)]
struct JoinGameRequest {
    username: String,
}

#[derive(Serialize)]
struct JoinGameResponse {
    token: u32,
    game_id: String,
    id: u32,
}

async fn join_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(req): Json<JoinGameRequest>,
) -> Result<Json<JoinGameResponse>, AppError> {
    let username = validate_name(&req.username)?;
    let id = u32::from_str_radix(&game_id, 16)
        .map_err(|_| AppError::from(JoinError::NoSuchGame))?;

    let token = state.registry.allocate_player(id, username).await?;
    Ok(Json(JoinGameResponse {
        token,
        game_id: format_id(id),
        id,
    }))
}

fn validate_name(name: &str) -> Result<&str, AppError> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(AppError::BadRequest(format!(
            "Names must be 1 to {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name)
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<JoinError> for AppError {
    fn from(e: JoinError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MapNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

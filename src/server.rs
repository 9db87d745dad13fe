//! HTTP surface for the matching core, consumed by the conversational
//! front-end.
//!
//! Routes:
//!   - `POST /questionnaire`  — answers -> adopter profile
//!   - `POST /match`          — adopter profile -> ranked results
//!   - `GET  /dogs/{id}`      — one canonical profile
//!   - `POST /dogs/{id}/status` — availability transition
//!   - `POST /dogs/{id}/matched` — record a successful match outcome
//!   - `GET  /health`

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::MatchError;
use crate::index::VectorIndex;
use crate::matcher::run_match;
use crate::models::{AdopterProfile, DogId, DogStatus};
use crate::questionnaire::{interpret, Answer, PreferenceExtractor};
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub index: Arc<VectorIndex>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub extractor: Arc<dyn PreferenceExtractor>,
    pub config: Config,
}

struct AppError(MatchError);

impl From<MatchError> for AppError {
    fn from(e: MatchError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            MatchError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            MatchError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            MatchError::CapabilityUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "capability_unavailable")
            }
            MatchError::StoreUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
            }
        };
        let body = json!({"error": {"code": code, "message": self.0.to_string()}});
        (status, Json(body)).into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/questionnaire", post(questionnaire))
        .route("/match", post(match_dogs))
        .route("/dogs/{id}", get(get_dog))
        .route("/dogs/{id}/status", post(set_status))
        .route("/dogs/{id}/matched", post(record_matched))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let bind = state.config.server.bind.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "match server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "indexed": state.index.len(),
        "embedding_provider": state.provider.model_name(),
    }))
}

#[derive(Deserialize)]
struct QuestionnaireRequest {
    answers: Vec<Answer>,
}

async fn questionnaire(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QuestionnaireRequest>,
) -> Result<Json<AdopterProfile>, AppError> {
    let profile = interpret(
        &req.answers,
        state.provider.as_ref(),
        state.extractor.as_ref(),
        &state.config.matching,
    )
    .await?;
    Ok(Json(profile))
}

#[derive(Deserialize)]
struct MatchRequest {
    adopter: AdopterProfile,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    5
}

async fn match_dogs(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MatchRequest>,
) -> Result<Json<crate::models::MatchResponse>, AppError> {
    let response = run_match(
        state.store.as_ref(),
        &state.index,
        &state.config.matching,
        &req.adopter,
        req.limit,
    )
    .await?;
    Ok(Json(response))
}

async fn get_dog(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let dog_id = DogId(id);
    match state.store.get(&dog_id).await? {
        Some(profile) => Ok(Json(profile).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": "not_found", "message": format!("unknown dog: {}", dog_id)}})),
        )
            .into_response()),
    }
}

#[derive(Deserialize)]
struct StatusRequest {
    status: DogStatus,
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Response, AppError> {
    let dog_id = DogId(id);
    match state.store.mark_status(&dog_id, req.status).await? {
        Some(profile) => {
            // Non-available dogs leave the search index immediately.
            if req.status == DogStatus::Available {
                if let (Some(vector), Some(hash)) = (&profile.embedding, &profile.embedding_hash) {
                    state.index.upsert(&profile.dog_id, vector.clone(), hash);
                }
            } else {
                state.index.remove(&dog_id);
            }
            Ok(Json(profile).into_response())
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": "not_found", "message": format!("unknown dog: {}", dog_id)}})),
        )
            .into_response()),
    }
}

async fn record_matched(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let dog_id = DogId(id);
    let at = chrono::Utc::now().timestamp();
    state.store.record_match_success(&dog_id, at).await?;
    state.index.set_last_match_at(&dog_id, at);
    Ok(Json(json!({"dog_id": dog_id, "last_match_at": at})))
}

//! HTTP front door: questions in, answers out, plus profile and health endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::mailbox::{Envelope, Phase, PostOffice, Received, EVALUATOR, PROFILE};
use crate::profile::{ProfileStore, UserProfile};
use crate::profile_service::InteractionReport;
use crate::ranker::{ConfidenceLog, ConfidenceSummary};
use crate::search::CandidateSearch;
use crate::types::{Candidate, FinalAnswer, RankingRequest, RequestId};

/// Shared handles for all routes
#[derive(Clone)]
pub struct AppState {
    pub post: PostOffice,
    pub search: Arc<dyn CandidateSearch>,
    pub profiles: ProfileStore,
    pub confidence: Arc<ConfidenceLog>,
    pub confidence_threshold: f64,
    pub answer_timeout: Duration,
    /// Candidates requested from search when `/ask` brings none
    pub search_k: usize,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub query: String,
    pub user_id: Option<String>,
    pub candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub request_id: RequestId,
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, details: Option<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            details,
        }),
    )
}

async fn ask_handler(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    if req.query.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Empty query", None));
    }
    info!("Received question: '{}' (user {:?})", req.query, req.user_id);

    let candidates = match req.candidates {
        Some(candidates) => candidates,
        None => state
            .search
            .search(&req.query, state.search_k)
            .await
            .map_err(|e| {
                error!("{} search failed: {:#}", state.search.name(), e);
                api_error(StatusCode::BAD_GATEWAY, "Candidate search failed", Some(e.to_string()))
            })?,
    };

    let request_id = RequestId::new();
    let reply_address = format!("http-{}", request_id);
    let mut inbox = state.post.register(reply_address.clone());

    let request = RankingRequest {
        request_id: Some(request_id),
        query: req.query,
        user_id: req.user_id,
        candidates,
    };
    let sent = match Envelope::new(&reply_address, EVALUATOR, Phase::Evaluation, &request) {
        Ok(envelope) => state.post.send(envelope).map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        state.post.unregister(&reply_address);
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Evaluation service unavailable",
            Some(e.to_string()),
        ));
    }

    let received = inbox.recv_timeout(state.answer_timeout).await;
    state.post.unregister(&reply_address);

    match received {
        Received::Message(envelope) if envelope.phase == Phase::Final => {
            let answer: FinalAnswer = envelope.parse().map_err(|e| {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "Malformed answer", Some(e.to_string()))
            })?;
            Ok(Json(AskResponse {
                request_id: answer.request_id,
                answer: answer.answer,
            }))
        }
        Received::Message(envelope) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unexpected reply",
            Some(envelope.phase.to_string()),
        )),
        Received::Idle | Received::Closed => {
            warn!("No answer for request {} within {:?}", request_id, state.answer_timeout);
            Err(api_error(StatusCode::GATEWAY_TIMEOUT, "Answer timed out", None))
        }
    }
}

async fn interaction_handler(
    State(state): State<AppState>,
    Json(report): Json<InteractionReport>,
) -> Result<StatusCode, ApiError> {
    let envelope = Envelope::new("http", PROFILE, Phase::Interaction, &report)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "Invalid interaction", Some(e.to_string())))?;
    state.post.send(envelope).map_err(|e| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Profile service unavailable",
            Some(e.to_string()),
        )
    })?;
    Ok(StatusCode::ACCEPTED)
}

async fn profile_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, ApiError> {
    match state.profiles.load(&user_id) {
        Ok(Some(profile)) => Ok(Json(profile)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Unknown user", None)),
        Err(e) => {
            error!("Failed to load profile {}: {:#}", user_id, e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Profile unavailable",
                Some(e.to_string()),
            ))
        }
    }
}

async fn stats_handler(State(state): State<AppState>) -> Json<ConfidenceSummary> {
    Json(state.confidence.summary(state.confidence_threshold))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "historag".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/ask", post(ask_handler))
        .route("/interaction", post(interaction_handler))
        .route("/profile/:user_id", get(profile_handler))
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

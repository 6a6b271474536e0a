//! HTTP API: intent intake, solver proposals and settlement status

use crate::config::ApiConfig;
use crate::coordination::SettlementEngine;
use crate::error::{SettlementError, SettlementResult};
use crate::intent::{IntentParams, IntentRecord, SolverProposal};
use crate::state::SettlementStore;
use crate::swap::{AtomicSwap, SwapLeg, SwapStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SettlementStore>,
    pub engine: Arc<SettlementEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/intents", post(create_intent))
        .route("/intents/:id", get(get_intent).delete(cancel_intent))
        .route(
            "/intents/:id/proposals",
            get(get_proposals).post(submit_proposal),
        )
        .route("/intents/:id/accept", post(accept_proposal))
        .route("/intents/:id/execute", post(execute_intent))
        .route("/swaps/:id", get(get_swap))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SettlementResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SettlementError::Config(format!("cannot bind API to {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| SettlementError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();
    let chain_health = state.engine.swaps().chain_health().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if store_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: store_ok && chains_ok,
            store: store_ok,
            chains: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

/// Verify and register a signed intent
async fn create_intent(
    State(state): State<AppState>,
    Json(request): Json<CreateIntentRequest>,
) -> Result<(StatusCode, Json<IntentCreated>), ApiError> {
    let intent_id = state
        .engine
        .intents()
        .create_intent(request.params, request.signature)
        .await?;
    Ok((StatusCode::CREATED, Json(IntentCreated { intent_id })))
}

async fn cancel_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Cancelled>, ApiError> {
    let intent_id = parse_hash(&id)?;
    let cancelled = state.engine.intents().cancel_intent(intent_id).await?;
    Ok(Json(Cancelled { cancelled }))
}

async fn submit_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(proposal): Json<SolverProposal>,
) -> Result<Json<Accepted>, ApiError> {
    let intent_id = parse_hash(&id)?;
    let accepted = state
        .engine
        .intents()
        .submit_proposal(intent_id, proposal)
        .await?;
    Ok(Json(Accepted { accepted }))
}

async fn accept_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AcceptRequest>,
) -> Result<Json<Accepted>, ApiError> {
    let intent_id = parse_hash(&id)?;
    let accepted = state
        .engine
        .intents()
        .accept_proposal(intent_id, request.solver)
        .await?;
    Ok(Json(Accepted { accepted }))
}

/// Start the swap for an accepted intent; it settles in the background
async fn execute_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Executing>), ApiError> {
    let intent_id = parse_hash(&id)?;
    let swap_id = state.engine.execute_intent(intent_id).await?;

    let engine = state.engine.clone();
    tokio::spawn(async move {
        // failures stay on the swap for the recovery loop
        if let Err(e) = engine.finish_swap(swap_id).await {
            error!("Swap {} did not finish: {}", swap_id, e);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(Executing { swap_id })))
}

async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IntentRecord>, ApiError> {
    let intent_id = parse_hash(&id)?;
    Ok(Json(state.engine.intents().get_intent(intent_id).await?))
}

/// Proposals in rank order
async fn get_proposals(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<SolverProposal>>, ApiError> {
    let intent_id = parse_hash(&id)?;
    Ok(Json(state.engine.intents().rank_proposals(intent_id).await?))
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapView>, ApiError> {
    let swap_id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest(format!("bad swap id {}", id)))?;
    Ok(Json(SwapView::from(state.engine.swaps().get_swap(swap_id).await?)))
}

fn parse_hash(raw: &str) -> Result<H256, ApiError> {
    raw.parse::<H256>()
        .map_err(|_| ApiError::BadRequest(format!("bad intent id {}", raw)))
}

// Request types

#[derive(Deserialize)]
struct CreateIntentRequest {
    params: IntentParams,
    /// 65-byte `r || s || v`, hex
    signature: Bytes,
}

#[derive(Deserialize)]
struct AcceptRequest {
    solver: Address,
}

// Response types

#[derive(Serialize)]
struct IntentCreated {
    intent_id: H256,
}

#[derive(Serialize)]
struct Cancelled {
    cancelled: bool,
}

#[derive(Serialize)]
struct Accepted {
    accepted: bool,
}

#[derive(Serialize)]
struct Executing {
    swap_id: Uuid,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

/// Swap as exposed over HTTP; the secret stays out
#[derive(Debug, Serialize)]
pub struct SwapView {
    pub id: Uuid,
    pub intent_id: Option<H256>,
    pub secret_hash: H256,
    pub status: SwapStatus,
    pub initiator: SwapLeg,
    pub participant: SwapLeg,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AtomicSwap> for SwapView {
    fn from(swap: AtomicSwap) -> Self {
        Self {
            id: swap.id,
            intent_id: swap.intent_id,
            secret_hash: swap.secret_hash,
            status: swap.status,
            initiator: swap.initiator,
            participant: swap.participant,
            failure: swap.failure,
            created_at: swap.created_at,
            updated_at: swap.updated_at,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum ApiError {
    BadRequest(String),
    Settlement(SettlementError),
}

impl From<SettlementError> for ApiError {
    fn from(e: SettlementError) -> Self {
        ApiError::Settlement(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Settlement(e) => {
                let status = match e {
                    SettlementError::IntentNotFound(_) | SettlementError::SwapNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    SettlementError::InvalidSignature { .. }
                    | SettlementError::InvalidIntent(_)
                    | SettlementError::IntentExpired { .. }
                    | SettlementError::InvalidTimelock(_) => StatusCode::BAD_REQUEST,
                    SettlementError::StateMismatch { .. } | SettlementError::AlreadySettled { .. } => {
                        StatusCode::CONFLICT
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

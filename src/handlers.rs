// HTTP request handlers for the stake pool API
//
// Every handler is a thin shell over `PoolEngine`: extract, call, wrap the
// result in `{ "success": true, ... }`. Rejections go through the
// `IntoResponse` impl for `EngineError` below.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use crate::app_state::SharedState;
use crate::auth::Actor;
use crate::error::EngineError;
use crate::models::*;

type ApiResult = Result<Json<Value>, EngineError>;

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Validation(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

// ===== HEALTH =====

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "stakepool-ledger",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// ===== ACCOUNT ENDPOINTS =====

/// POST /accounts - open the caller's account with the starting balance
pub async fn open_account(State(state): State<SharedState>, actor: Actor) -> ApiResult {
    let account = state
        .engine
        .open_account(&actor.user_id, state.config.starting_balance)?;
    Ok(Json(json!({ "success": true, "account": account })))
}

/// GET /accounts/:user - the owner or an admin only
pub async fn get_balance(
    State(state): State<SharedState>,
    actor: Actor,
    Path(user_id): Path<String>,
) -> ApiResult {
    actor.ensure_can_view(&user_id)?;
    let balance = state.engine.balance(&user_id)?;
    Ok(Json(json!({ "success": true, "user_id": user_id, "balance": balance })))
}

pub async fn get_journal(
    State(state): State<SharedState>,
    actor: Actor,
    Path(user_id): Path<String>,
) -> ApiResult {
    actor.ensure_can_view(&user_id)?;
    let entries = state.engine.journal(&user_id)?;
    Ok(Json(json!({
        "success": true,
        "user_id": user_id,
        "count": entries.len(),
        "entries": entries,
    })))
}

// ===== MARKET MEMBERSHIP =====

pub async fn register_market(
    State(state): State<SharedState>,
    actor: Actor,
    Json(payload): Json<RegisterMarketRequest>,
) -> ApiResult {
    state.markets.register_market(&payload.market_id, &actor.user_id)?;
    Ok(Json(json!({
        "success": true,
        "market_id": payload.market_id,
        "owner": actor.user_id,
    })))
}

pub async fn add_member(
    State(state): State<SharedState>,
    actor: Actor,
    Path(market_id): Path<String>,
    Json(payload): Json<AddMemberRequest>,
) -> ApiResult {
    state.markets.add_member(&actor, &market_id, &payload.user_id)?;
    Ok(Json(json!({
        "success": true,
        "market_id": market_id,
        "user_id": payload.user_id,
    })))
}

// ===== EVENT ENDPOINTS =====

pub async fn create_event(
    State(state): State<SharedState>,
    actor: Actor,
    Json(payload): Json<NewEvent>,
) -> ApiResult {
    let event = state.engine.create_event(&actor, payload)?;
    Ok(Json(json!({ "success": true, "event": event })))
}

/// GET /events/:id - event with its settlement status
pub async fn get_event(State(state): State<SharedState>, Path(event_id): Path<String>) -> ApiResult {
    let event = state.engine.event(&event_id)?;
    Ok(Json(json!({
        "success": true,
        "settled": event.is_settled(),
        "event": event,
    })))
}

pub async fn get_odds(State(state): State<SharedState>, Path(event_id): Path<String>) -> ApiResult {
    let odds = state.engine.compute_odds(&event_id)?;
    Ok(Json(json!({ "success": true, "odds": odds })))
}

pub async fn get_potential_payout(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
) -> ApiResult {
    let payout = state.engine.potential_payout(&event_id, &actor.user_id)?;
    Ok(Json(json!({ "success": true, "payout": payout })))
}

// ===== STAKE ENDPOINT =====

pub async fn place_stake(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
    Json(payload): Json<PlaceStakeRequest>,
) -> ApiResult {
    let receipt = state
        .engine
        .place_stake(&actor, &event_id, payload.selector, payload.amount)?;
    Ok(Json(json!({
        "success": true,
        "stake": receipt.stake,
        "shares": receipt.stake.shares(),
        "price": receipt.stake.price(),
        "new_balance": receipt.balance,
        "odds_before": receipt.odds_before,
        "odds_after": receipt.odds_after,
        "potential_payout": receipt.potential_payout,
    })))
}

// ===== LIFECYCLE =====

pub async fn close_event(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
) -> ApiResult {
    let event = state.engine.close(&actor, &event_id)?;
    Ok(Json(json!({ "success": true, "event": event })))
}

pub async fn reopen_event(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
) -> ApiResult {
    let event = state.engine.reopen(&actor, &event_id)?;
    Ok(Json(json!({ "success": true, "event": event })))
}

pub async fn cast_vote(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
    Json(payload): Json<VoteRequest>,
) -> ApiResult {
    let vote = state
        .engine
        .vote(&actor, &event_id, payload.outcome, &payload.reason)?;
    Ok(Json(json!({ "success": true, "vote": vote })))
}

pub async fn get_votes(State(state): State<SharedState>, Path(event_id): Path<String>) -> ApiResult {
    let tally = state.engine.vote_tally(&event_id)?;
    let votes = state.engine.votes(&event_id)?;
    Ok(Json(json!({ "success": true, "tally": tally, "votes": votes })))
}

pub async fn resolve_event(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
    Json(payload): Json<ResolveRequest>,
) -> ApiResult {
    let resolution = state.engine.resolve(&actor, &event_id, payload.outcome)?;
    Ok(Json(json!({
        "success": true,
        "event": resolution.event,
        "settlement": resolution.settlement,
    })))
}

pub async fn settle_event(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
) -> ApiResult {
    let outcome = state.engine.settle(&actor, &event_id)?;
    Ok(Json(json!({ "success": true, "settlement": outcome })))
}

// ===== DISPUTES =====

pub async fn file_dispute(
    State(state): State<SharedState>,
    actor: Actor,
    Path(event_id): Path<String>,
    Json(payload): Json<DisputeRequest>,
) -> ApiResult {
    let receipt = state.engine.dispute(&actor, &event_id, &payload.reason)?;
    Ok(Json(json!({
        "success": true,
        "dispute": receipt.dispute,
        "event": receipt.event,
        "reversals": receipt.reversals,
    })))
}

pub async fn list_disputes(State(state): State<SharedState>, Path(event_id): Path<String>) -> ApiResult {
    let disputes = state.engine.disputes(&event_id)?;
    Ok(Json(json!({ "success": true, "disputes": disputes })))
}

pub async fn review_dispute(
    State(state): State<SharedState>,
    actor: Actor,
    Path((event_id, dispute_id)): Path<(String, u64)>,
) -> ApiResult {
    let dispute = state.engine.review_dispute(&actor, &event_id, dispute_id)?;
    Ok(Json(json!({ "success": true, "dispute": dispute })))
}

pub async fn conclude_dispute(
    State(state): State<SharedState>,
    actor: Actor,
    Path((event_id, dispute_id)): Path<(String, u64)>,
    Json(payload): Json<ConcludeDisputeRequest>,
) -> ApiResult {
    let dispute = state
        .engine
        .conclude_dispute(&actor, &event_id, dispute_id, payload.upheld)?;
    Ok(Json(json!({ "success": true, "dispute": dispute })))
}

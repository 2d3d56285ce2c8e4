// Routes module - maps HTTP paths onto the handlers

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app_state::SharedState;
use crate::handlers::*;

pub fn router(state: SharedState) -> Router {
    Router::new()
        // ===== HEALTH CHECK =====
        .route("/", get(health_check))
        .route("/health", get(health_check))

        // ===== ACCOUNTS =====
        .route("/accounts", post(open_account))
        .route("/accounts/:user", get(get_balance))
        .route("/accounts/:user/journal", get(get_journal))

        // ===== MARKETS =====
        .route("/markets", post(register_market))
        .route("/markets/:id/members", post(add_member))

        // ===== EVENTS =====
        .route("/events", post(create_event))
        .route("/events/:id", get(get_event))
        .route("/events/:id/odds", get(get_odds))
        .route("/events/:id/payout", get(get_potential_payout))
        .route("/events/:id/stakes", post(place_stake))

        // ===== LIFECYCLE =====
        .route("/events/:id/close", post(close_event))
        .route("/events/:id/reopen", post(reopen_event))
        .route("/events/:id/votes", post(cast_vote).get(get_votes))
        .route("/events/:id/resolve", post(resolve_event))
        .route("/events/:id/settle", post(settle_event))

        // ===== DISPUTES =====
        .route("/events/:id/disputes", post(file_dispute).get(list_disputes))
        .route("/events/:id/disputes/:dispute/review", post(review_dispute))
        .route("/events/:id/disputes/:dispute/conclude", post(conclude_dispute))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

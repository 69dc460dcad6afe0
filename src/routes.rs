//! Route definitions for the EcoVault API

use axum::{routing::get, Router};

use crate::app_state::AppState;
use crate::handlers::*;

// Submission routes
pub fn submission_routes() -> Router<AppState> {
    Router::new()
        .route("/api/submissions", axum::routing::post(create_submission))
        .route("/api/submissions", get(list_my_submissions))
        .route("/api/submissions/:id", get(get_submission_detail))
        .route(
            "/api/submissions/:id",
            axum::routing::delete(delete_submission),
        )
}

// Moderation routes
pub fn moderation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/moderation/queue", get(moderation_queue))
        .route(
            "/api/moderation/submissions/:id/approve",
            axum::routing::post(approve_submission),
        )
        .route(
            "/api/moderation/submissions/:id/reject",
            axum::routing::post(reject_submission),
        )
        .route(
            "/api/moderation/cashouts/:id/initiate",
            axum::routing::post(initiate_cashout),
        )
}

// Wallet routes
pub fn wallet_routes() -> Router<AppState> {
    Router::new().route("/api/wallet", get(get_wallet))
}

// Cashout routes
pub fn cashout_routes() -> Router<AppState> {
    Router::new()
        .route("/api/cashouts", axum::routing::post(create_cashout))
        .route("/api/cashouts", get(list_my_cashouts))
        .route("/api/cashouts/:id", get(get_cashout))
        .route(
            "/api/cashouts/:id/cancel",
            axum::routing::post(cancel_cashout),
        )
}

// Payout webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/api/payouts/webhook", axum::routing::post(payout_webhook))
}

// Collection point routes
pub fn collection_point_routes() -> Router<AppState> {
    Router::new()
        .route("/api/collection-points", get(list_collection_points))
        .route(
            "/api/admin/collection-points",
            axum::routing::post(create_collection_point),
        )
        .route(
            "/api/admin/collection-points/:id/active",
            axum::routing::patch(set_collection_point_active),
        )
}

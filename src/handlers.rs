//! API handlers for the EcoVault backend

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::app_state::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::CoreError;
use crate::models::{
    ApiResponse, CashoutRequest, CollectionPoint, CreateCashoutRequest,
    CreateCollectionPointRequest, CreateSubmissionRequest, ModerationDecisionRequest,
    PaginationParams, PayoutWebhookPayload, SetActiveRequest, Submission, SubmissionDetail,
    WalletView,
};

type HandlerResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<T>>)>;

pub async fn root() -> &'static str {
    "EcoVault API Server"
}

pub async fn health_check() -> &'static str {
    "OK"
}

fn success<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

fn failure<T>(err: CoreError) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
}

fn invalid<T>(err: validator::ValidationErrors) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(format!("Validation error: {err}")),
        }),
    )
}

// ===== Submission Handlers =====

/// Submit capture metadata for verification
pub async fn create_submission(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateSubmissionRequest>,
) -> HandlerResult<Submission> {
    if let Err(e) = request.validate() {
        return Err(invalid(e));
    }

    match app_state.submission_service.create(&user, request).await {
        Ok(submission) => Ok(success(submission)),
        Err(e) => Err(failure(e)),
    }
}

/// Submission detail with audit trail (owner or moderator)
pub async fn get_submission_detail(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> HandlerResult<SubmissionDetail> {
    match app_state.submission_service.get_detail(id, &user).await {
        Ok(detail) => Ok(success(detail)),
        Err(e) => Err(failure(e)),
    }
}

/// List the caller's own submissions
pub async fn list_my_submissions(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Query(pagination): Query<PaginationParams>,
) -> HandlerResult<Vec<Submission>> {
    let (limit, offset) = pagination.limit_offset();
    match app_state
        .submission_service
        .list_for_user(user.user_id, limit, offset)
        .await
    {
        Ok(submissions) => Ok(success(submissions)),
        Err(e) => Err(failure(e)),
    }
}

/// Delete an undecided submission (owner, or any moderator)
pub async fn delete_submission(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> HandlerResult<()> {
    match app_state.submission_service.delete(id, &user).await {
        Ok(()) => Ok(success(())),
        Err(e) => Err(failure(e)),
    }
}

// ===== Moderation Handlers =====

/// Review queue, oldest first
pub async fn moderation_queue(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Query(pagination): Query<PaginationParams>,
) -> HandlerResult<Vec<Submission>> {
    if !user.can_moderate() {
        return Err(failure(CoreError::Forbidden));
    }

    let (limit, offset) = pagination.limit_offset();
    match app_state.submission_service.moderation_queue(limit, offset).await {
        Ok(submissions) => Ok(success(submissions)),
        Err(e) => Err(failure(e)),
    }
}

/// Approve a submission and credit the award
pub async fn approve_submission(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ModerationDecisionRequest>,
) -> HandlerResult<Submission> {
    if !user.can_moderate() {
        return Err(failure(CoreError::Forbidden));
    }

    match app_state
        .submission_service
        .approve(id, user.user_id, request.reason)
        .await
    {
        Ok(submission) => Ok(success(submission)),
        Err(e) => Err(failure(e)),
    }
}

/// Reject a submission with a required reason
pub async fn reject_submission(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ModerationDecisionRequest>,
) -> HandlerResult<Submission> {
    if !user.can_moderate() {
        return Err(failure(CoreError::Forbidden));
    }

    let Some(reason) = request.reason else {
        return Err(failure(CoreError::MissingReason));
    };
    match app_state
        .submission_service
        .reject(id, user.user_id, reason)
        .await
    {
        Ok(submission) => Ok(success(submission)),
        Err(e) => Err(failure(e)),
    }
}

// ===== Wallet Handlers =====

/// Current balances for the caller
pub async fn get_wallet(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
) -> HandlerResult<WalletView> {
    match app_state.wallet_service.get_or_create(user.user_id).await {
        Ok(wallet) => Ok(success(wallet.into())),
        Err(e) => Err(failure(e)),
    }
}

// ===== Cashout Handlers =====

/// Request a points-to-cash payout
pub async fn create_cashout(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateCashoutRequest>,
) -> HandlerResult<CashoutRequest> {
    if let Err(e) = request.validate() {
        return Err(invalid(e));
    }

    match app_state.cashout_service.create(&user, request).await {
        Ok(cashout) => Ok(success(cashout)),
        Err(e) => Err(failure(e)),
    }
}

/// Cashout detail with its payout transaction (owner or moderator)
pub async fn get_cashout(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> HandlerResult<serde_json::Value> {
    let cashout = match app_state.cashout_service.get(id).await {
        Ok(Some(cashout)) => cashout,
        Ok(None) => return Err(failure(CoreError::NotFound("cashout request"))),
        Err(e) => return Err(failure(e)),
    };
    if cashout.user_id != user.user_id && !user.can_moderate() {
        return Err(failure(CoreError::Forbidden));
    }

    match app_state.cashout_service.get_transaction(id).await {
        Ok(transaction) => Ok(success(json!({
            "cashout": cashout,
            "transaction": transaction,
        }))),
        Err(e) => Err(failure(e)),
    }
}

/// List the caller's cashout requests
pub async fn list_my_cashouts(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Query(pagination): Query<PaginationParams>,
) -> HandlerResult<Vec<CashoutRequest>> {
    let (limit, offset) = pagination.limit_offset();
    match app_state
        .cashout_service
        .list_for_user(user.user_id, limit, offset)
        .await
    {
        Ok(cashouts) => Ok(success(cashouts)),
        Err(e) => Err(failure(e)),
    }
}

/// Cancel a still-pending cashout (owner only)
pub async fn cancel_cashout(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> HandlerResult<CashoutRequest> {
    match app_state.cashout_service.cancel(id, &user).await {
        Ok(cashout) => Ok(success(cashout)),
        Err(e) => Err(failure(e)),
    }
}

/// Hand a pending cashout to the payout gateway (moderator)
pub async fn initiate_cashout(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> HandlerResult<CashoutRequest> {
    if !user.can_moderate() {
        return Err(failure(CoreError::Forbidden));
    }

    match app_state.cashout_service.initiate(id).await {
        Ok(cashout) => Ok(success(cashout)),
        Err(e) => Err(failure(e)),
    }
}

// ===== Webhook Handler =====

/// Payout gateway reconciliation endpoint
pub async fn payout_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PayoutWebhookPayload>,
) -> HandlerResult<()> {
    // Authenticate webhook
    match &app_state.webhook_secret {
        Some(secret) if !secret.is_empty() => {
            let auth_header = headers
                .get("X-Webhook-Secret")
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();

            if auth_header != secret {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    Json(ApiResponse {
                        success: false,
                        data: None,
                        error: Some("Unauthorized webhook request".to_string()),
                    }),
                ));
            }
        }
        _ => {
            // Fail-closed: if secret is not configured or empty, reject all requests
            tracing::error!("Webhook secret not configured - rejecting request");
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse {
                    success: false,
                    data: None,
                    error: Some("Webhook endpoint is not configured".to_string()),
                }),
            ));
        }
    }

    match app_state.cashout_service.handle_webhook(payload).await {
        Ok(()) => Ok(success(())),
        Err(e) => Err(failure(e)),
    }
}

// ===== Collection Point Handlers =====

/// Active collection points
pub async fn list_collection_points(
    State(app_state): State<AppState>,
) -> HandlerResult<Vec<CollectionPoint>> {
    match app_state.geo_service.list_active().await {
        Ok(points) => Ok(success(points)),
        Err(e) => Err(failure(CoreError::Internal(e))),
    }
}

/// Register a collection point (admin)
pub async fn create_collection_point(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateCollectionPointRequest>,
) -> HandlerResult<CollectionPoint> {
    if !user.is_admin() {
        return Err(failure(CoreError::Forbidden));
    }
    if let Err(e) = request.validate() {
        return Err(invalid(e));
    }

    match app_state.geo_service.create_point(request).await {
        Ok(point) => Ok(success(point)),
        Err(e) => Err(failure(CoreError::Internal(e))),
    }
}

/// Activate or deactivate a collection point (admin)
pub async fn set_collection_point_active(
    State(app_state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> HandlerResult<CollectionPoint> {
    if !user.is_admin() {
        return Err(failure(CoreError::Forbidden));
    }

    match app_state.geo_service.set_active(id, request.active).await {
        Ok(Some(point)) => Ok(success(point)),
        Ok(None) => Err(failure(CoreError::NotFound("collection point"))),
        Err(e) => Err(failure(CoreError::Internal(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_answers_ok() {
        let app = Router::new().route("/health", get(health_check));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}

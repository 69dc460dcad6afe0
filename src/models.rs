//! Data models for the EcoVault backend

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// User roles, forwarded by the auth gateway and checked once at the API
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Member,
    Moderator,
    Admin,
}

impl std::str::FromStr for UserRole {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "member" => Ok(UserRole::Member),
            "moderator" => Ok(UserRole::Moderator),
            "admin" => Ok(UserRole::Admin),
            _ => Err(()),
        }
    }
}

/// A registered physical location where eco-actions are expected to occur.
/// Never deleted, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionPoint {
    pub id: Uuid,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Submission lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "submission_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Queued,
    AutoVerified,
    NeedsReview,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    /// Legal transition graph. Everything else fails `InvalidStateTransition`.
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        matches!(
            (self, next),
            (Queued, AutoVerified)
                | (Queued, NeedsReview)
                | (Queued, Rejected)
                | (AutoVerified, Approved)
                | (AutoVerified, Rejected)
                | (NeedsReview, Approved)
                | (NeedsReview, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionStatus::Approved | SubmissionStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::AutoVerified => "auto_verified",
            SubmissionStatus::NeedsReview => "needs_review",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video evidence submission
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: Uuid,
    pub media_key: String,
    pub thumbnail_key: Option<String>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub fingerprint: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub recorded_at: DateTime<Utc>,
    pub collection_point_id: Uuid,
    pub auto_score: Option<i32>,
    pub status: SubmissionStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit trail event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "submission_event_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubmissionEventKind {
    Created,
    AutoVerified,
    NeedsReview,
    Approved,
    Rejected,
    PointsCredited,
}

/// Append-only audit fact; never mutated, deleted only as part of deleting a
/// still-deletable submission.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubmissionEvent {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub kind: SubmissionEventKind,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Per-user balances. Mutated only through the wallet ledger operations.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub points_balance: i64,
    pub cash_balance: Decimal,
    pub locked_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Cash not reserved against a pending payout.
    pub fn available_cash(&self) -> Decimal {
        self.cash_balance - self.locked_amount
    }
}

/// Supported payout rails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payout_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    BankTransfer,
    CardWallet,
    Paypal,
    Stripe,
    Crypto,
    Upi,
}

/// Cashout request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "cashout_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CashoutStatus {
    Pending,
    Initiated,
    Succeeded,
    Failed,
    Canceled,
}

impl CashoutStatus {
    pub fn can_transition_to(self, next: CashoutStatus) -> bool {
        use CashoutStatus::*;
        matches!(
            (self, next),
            (Pending, Initiated) | (Pending, Canceled) | (Initiated, Succeeded) | (Initiated, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CashoutStatus::Succeeded | CashoutStatus::Failed | CashoutStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CashoutStatus::Pending => "pending",
            CashoutStatus::Initiated => "initiated",
            CashoutStatus::Succeeded => "succeeded",
            CashoutStatus::Failed => "failed",
            CashoutStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for CashoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points-to-cash redemption request
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CashoutRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub points_used: i64,
    pub cash_amount: Decimal,
    pub method: PayoutMethod,
    pub destination_ref: String,
    pub status: CashoutStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Gateway-side payout lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payout_txn_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutTxnStatus {
    Initiated,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

/// One gateway payout attempt per cashout request; the raw webhook payload is
/// kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PayoutTransaction {
    pub id: Uuid,
    pub cashout_id: Uuid,
    pub gateway: String,
    pub gateway_txn_id: Option<String>,
    pub status: PayoutTxnStatus,
    pub raw_payload: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PaginationParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl PaginationParams {
    /// Clamped (limit, offset) pair.
    pub fn limit_offset(self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(20).clamp(1, 100);
        (limit, (page - 1) * limit)
    }
}

// ===== Request / response payloads =====

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubmissionRequest {
    #[validate(length(min = 1))]
    pub media_key: String,
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    pub recorded_at: DateTime<Utc>,
    #[validate(length(min = 1))]
    pub device_fingerprint: String,
}

#[derive(Debug, Deserialize)]
pub struct ModerationDecisionRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCashoutRequest {
    #[validate(range(min = 1))]
    pub points: i64,
    pub method: PayoutMethod,
    #[validate(length(min = 1))]
    pub destination_ref: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCollectionPointRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    #[validate(range(min = 1.0, max = 100000.0))]
    pub radius_m: f64,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

/// Inbound payout webhook. Signature verification happens in the gateway
/// adapter fronting this endpoint; here the shared-secret header gates access.
#[derive(Debug, Clone, Deserialize)]
pub struct PayoutWebhookPayload {
    pub reference: Uuid,
    pub status: String,
    pub gateway_txn_id: Option<String>,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    pub failure_reason: Option<String>,
}

/// Submission detail with its audit trail and short-lived media links.
#[derive(Debug, Serialize)]
pub struct SubmissionDetail {
    #[serde(flatten)]
    pub submission: Submission,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub events: Vec<SubmissionEvent>,
}

/// Wallet balances plus derived availability.
#[derive(Debug, Serialize)]
pub struct WalletView {
    pub points_balance: i64,
    pub cash_balance: Decimal,
    pub locked_amount: Decimal,
    pub available_cash: Decimal,
}

impl From<Wallet> for WalletView {
    fn from(wallet: Wallet) -> Self {
        Self {
            available_cash: wallet.available_cash(),
            points_balance: wallet.points_balance,
            cash_balance: wallet.cash_balance,
            locked_amount: wallet.locked_amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_transitions_follow_the_graph() {
        use SubmissionStatus::*;

        assert!(Queued.can_transition_to(AutoVerified));
        assert!(Queued.can_transition_to(NeedsReview));
        assert!(Queued.can_transition_to(Rejected));
        assert!(AutoVerified.can_transition_to(Approved));
        assert!(AutoVerified.can_transition_to(Rejected));
        assert!(NeedsReview.can_transition_to(Approved));
        assert!(NeedsReview.can_transition_to(Rejected));

        // No backward or skip transitions.
        assert!(!Queued.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!AutoVerified.can_transition_to(Queued));
        assert!(!NeedsReview.can_transition_to(Queued));
        assert!(!Approved.can_transition_to(Queued));
    }

    #[test]
    fn submission_terminal_states() {
        assert!(SubmissionStatus::Approved.is_terminal());
        assert!(SubmissionStatus::Rejected.is_terminal());
        assert!(!SubmissionStatus::Queued.is_terminal());
        assert!(!SubmissionStatus::AutoVerified.is_terminal());
        assert!(!SubmissionStatus::NeedsReview.is_terminal());
    }

    #[test]
    fn cashout_transitions_follow_the_graph() {
        use CashoutStatus::*;

        assert!(Pending.can_transition_to(Initiated));
        assert!(Pending.can_transition_to(Canceled));
        assert!(Initiated.can_transition_to(Succeeded));
        assert!(Initiated.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Initiated.can_transition_to(Canceled));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Initiated));
        assert!(!Canceled.can_transition_to(Initiated));
    }

    #[test]
    fn available_cash_subtracts_locked_funds() {
        let wallet = Wallet {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            points_balance: 500,
            cash_balance: "12.50".parse().unwrap(),
            locked_amount: "10.00".parse().unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(wallet.available_cash(), "2.50".parse::<Decimal>().unwrap());
    }

    #[test]
    fn pagination_is_clamped() {
        let params = PaginationParams {
            page: Some(0),
            limit: Some(1000),
        };
        assert_eq!(params.limit_offset(), (100, 0));

        let params = PaginationParams {
            page: Some(3),
            limit: Some(20),
        };
        assert_eq!(params.limit_offset(), (20, 40));
    }
}

//! Cashout state machine: points-to-cash redemption against external payout
//! rails.
//!
//! Cash equal to the request's value is locked at creation so it cannot be
//! spent twice; the committed points are deducted only on final success.
//! Webhook application is guarded by the request's current status, which
//! makes duplicate and out-of-order terminal deliveries no-ops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::gateway::{GatewayError, GatewayRouter, PayoutOrder};
use crate::models::{
    CashoutRequest, CashoutStatus, CreateCashoutRequest, PayoutTransaction, PayoutTxnStatus,
    PayoutWebhookPayload, Wallet,
};
use crate::submission_service::ensure_user;
use crate::verification_worker::backoff_delay;
use crate::wallet_service::WalletService;

/// Cash value of a point balance at the configured conversion rate.
pub fn cash_value(points: i64, rate: Decimal) -> Decimal {
    (Decimal::from(points) * rate).round_dp(2)
}

/// Configured payout bounds.
pub fn validate_bounds(amount: Decimal, min: Decimal, max: Decimal) -> Result<(), CoreError> {
    if amount < min {
        return Err(CoreError::BelowMinimum(amount));
    }
    if amount > max {
        return Err(CoreError::AboveMaximum(amount));
    }
    Ok(())
}

/// Normalized webhook verdicts per the gateway contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Succeeded,
    Failed,
    Cancelled,
    Processing,
}

/// Map a gateway status string; unknown statuses return `None` and are
/// logged and ignored rather than guessed.
pub fn map_gateway_status(status: &str) -> Option<WebhookOutcome> {
    let status = status.trim();
    if status.eq_ignore_ascii_case("succeeded") {
        Some(WebhookOutcome::Succeeded)
    } else if status.eq_ignore_ascii_case("failed") {
        Some(WebhookOutcome::Failed)
    } else if status.eq_ignore_ascii_case("cancelled") || status.eq_ignore_ascii_case("canceled") {
        Some(WebhookOutcome::Cancelled)
    } else if status.eq_ignore_ascii_case("processing") {
        Some(WebhookOutcome::Processing)
    } else {
        None
    }
}

pub struct CashoutService {
    pool: PgPool,
    wallet: Arc<WalletService>,
    gateways: Arc<GatewayRouter>,
    config: Arc<AppConfig>,
}

impl CashoutService {
    pub fn new(
        pool: PgPool,
        wallet: Arc<WalletService>,
        gateways: Arc<GatewayRouter>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            pool,
            wallet,
            gateways,
            config,
        }
    }

    /// Create a pending cashout: verify points cover the request, lock the
    /// cash equivalent, and open the payout transaction record.
    pub async fn create(
        &self,
        user: &AuthenticatedUser,
        request: CreateCashoutRequest,
    ) -> Result<CashoutRequest, CoreError> {
        if request.points <= 0 {
            return Err(CoreError::NonPositiveAmount);
        }
        let amount = cash_value(request.points, self.config.cashout_rate);
        validate_bounds(amount, self.config.cashout_min, self.config.cashout_max)?;

        let mut tx = self.pool.begin().await?;
        ensure_user(&mut *tx, user.user_id, user.role).await?;
        self.wallet.ensure_exists(&mut *tx, user.user_id).await?;

        let (open,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM cashout_requests WHERE user_id = $1 AND status IN ('pending', 'initiated'))",
        )
        .bind(user.user_id)
        .fetch_one(&mut *tx)
        .await?;
        if open {
            return Err(CoreError::DuplicatePendingRequest);
        }

        // Points are the committed asset; they stay in the balance until the
        // payout succeeds. The row lock serializes against concurrent credits
        // and other cashout attempts.
        let wallet =
            sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE")
                .bind(user.user_id)
                .fetch_one(&mut *tx)
                .await?;
        if wallet.points_balance < request.points {
            return Err(CoreError::InsufficientPoints);
        }

        self.wallet.lock_cash(&mut *tx, user.user_id, amount).await?;

        let cashout = sqlx::query_as::<_, CashoutRequest>(
            r#"
            INSERT INTO cashout_requests (
                id, user_id, points_used, cash_amount, method, destination_ref,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', now(), now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user.user_id)
        .bind(request.points)
        .bind(amount)
        .bind(request.method)
        .bind(&request.destination_ref)
        .fetch_one(&mut *tx)
        .await
        // The partial unique index is the backstop for concurrent creates.
        .map_err(duplicate_or_db)?;

        let gateway = self.gateways.for_method(request.method);
        sqlx::query(
            r#"
            INSERT INTO payout_transactions (id, cashout_id, gateway, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'initiated', now(), now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cashout.id)
        .bind(gateway.name())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(cashout = %cashout.id, user = %user.user_id, amount = %amount, "cashout created");
        Ok(cashout)
    }

    /// Hand the pending request to the payout gateway. The request is
    /// claimed (`pending` -> `initiated`) before the gateway call so a racing
    /// cancel loses cleanly; gateway rejection or exhaustion of retries
    /// degrades to `failed` with the cash unlocked.
    pub async fn initiate(&self, cashout_id: Uuid) -> Result<CashoutRequest, CoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query_as::<_, CashoutRequest>(
            r#"
            UPDATE cashout_requests SET status = 'initiated', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(cashout_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cashout) = claimed else {
            let current = self.current_status(cashout_id).await?;
            return Err(match current {
                None => CoreError::NotFound("cashout request"),
                Some(status) => CoreError::InvalidStateTransition {
                    entity: "cashout",
                    from: status.to_string(),
                    to: CashoutStatus::Initiated.to_string(),
                },
            });
        };
        tx.commit().await?;

        let gateway = self.gateways.for_method(cashout.method);
        let order = PayoutOrder {
            reference: cashout.id,
            amount: cashout.cash_amount,
            currency: self.config.payout_currency.clone(),
            method: cashout.method,
            destination_ref: cashout.destination_ref.clone(),
        };

        let mut attempt = 0u32;
        let ack = loop {
            match gateway.initiate_payout(&order).await {
                Ok(ack) => break ack,
                Err(GatewayError::Rejected(reason)) => {
                    warn!(cashout = %cashout.id, %reason, "gateway rejected payout");
                    return self.fail_open_request(cashout.id, &reason).await;
                }
                Err(GatewayError::Unavailable(reason)) => {
                    attempt += 1;
                    if attempt >= self.config.gateway_max_attempts {
                        warn!(cashout = %cashout.id, attempts = attempt, %reason, "gateway unreachable, giving up");
                        return self
                            .fail_open_request(cashout.id, &format!("gateway unreachable: {reason}"))
                            .await;
                    }
                    let delay = backoff_delay(
                        attempt,
                        Duration::from_millis(self.config.retry_base_delay_ms),
                    );
                    debug!(cashout = %cashout.id, attempt, delay_ms = delay.as_millis() as u64, "retrying gateway");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        sqlx::query(
            r#"
            UPDATE payout_transactions
            SET status = 'processing', gateway_txn_id = $2, updated_at = now()
            WHERE cashout_id = $1
            "#,
        )
        .bind(cashout.id)
        .bind(&ack.gateway_txn_id)
        .execute(&self.pool)
        .await?;

        info!(cashout = %cashout.id, gateway_txn = %ack.gateway_txn_id, "payout initiated");
        Ok(cashout)
    }

    /// Reconcile a gateway notification. Idempotent: re-delivering the same
    /// terminal status is a no-op, and unknown statuses change nothing.
    pub async fn handle_webhook(&self, payload: PayoutWebhookPayload) -> Result<(), CoreError> {
        let Some(outcome) = map_gateway_status(&payload.status) else {
            warn!(reference = %payload.reference, status = %payload.status, "ignoring unknown gateway status");
            return Ok(());
        };

        match outcome {
            WebhookOutcome::Processing => {
                sqlx::query(
                    r#"
                    UPDATE payout_transactions
                    SET status = 'processing', gateway_txn_id = COALESCE($2, gateway_txn_id),
                        raw_payload = $3, updated_at = now()
                    WHERE cashout_id = $1 AND status IN ('initiated', 'processing')
                    "#,
                )
                .bind(payload.reference)
                .bind(&payload.gateway_txn_id)
                .bind(&payload.raw_payload)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            WebhookOutcome::Succeeded => self.apply_success(payload).await,
            WebhookOutcome::Failed | WebhookOutcome::Cancelled => {
                self.apply_failure(payload, outcome).await
            }
        }
    }

    /// User cancellation, legal only while still `pending`.
    pub async fn cancel(
        &self,
        cashout_id: Uuid,
        user: &AuthenticatedUser,
    ) -> Result<CashoutRequest, CoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, CashoutRequest>(
            r#"
            UPDATE cashout_requests SET status = 'canceled', updated_at = now()
            WHERE id = $1 AND user_id = $2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(cashout_id)
        .bind(user.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cashout) = updated else {
            let existing = self.get(cashout_id).await?;
            return Err(match existing {
                None => CoreError::NotFound("cashout request"),
                Some(other) if other.user_id != user.user_id => CoreError::Forbidden,
                Some(other) => CoreError::InvalidStateTransition {
                    entity: "cashout",
                    from: other.status.to_string(),
                    to: CashoutStatus::Canceled.to_string(),
                },
            });
        };

        self.wallet
            .unlock_cash(&mut *tx, cashout.user_id, cashout.cash_amount)
            .await?;
        sqlx::query(
            "UPDATE payout_transactions SET status = 'cancelled', processed_at = $2, updated_at = now() WHERE cashout_id = $1",
        )
        .bind(cashout.id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(cashout = %cashout.id, user = %user.user_id, "cashout canceled");
        Ok(cashout)
    }

    pub async fn get(&self, cashout_id: Uuid) -> Result<Option<CashoutRequest>, CoreError> {
        let cashout =
            sqlx::query_as::<_, CashoutRequest>("SELECT * FROM cashout_requests WHERE id = $1")
                .bind(cashout_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cashout)
    }

    pub async fn get_transaction(
        &self,
        cashout_id: Uuid,
    ) -> Result<Option<PayoutTransaction>, CoreError> {
        let txn = sqlx::query_as::<_, PayoutTransaction>(
            "SELECT * FROM payout_transactions WHERE cashout_id = $1",
        )
        .bind(cashout_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(txn)
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CashoutRequest>, CoreError> {
        let cashouts = sqlx::query_as::<_, CashoutRequest>(
            "SELECT * FROM cashout_requests WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(cashouts)
    }

    // ===== Webhook application =====

    async fn apply_success(&self, payload: PayoutWebhookPayload) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        // Terminal notifications may arrive before our own initiate claim
        // commits, so `pending` is accepted alongside `initiated`.
        let updated = sqlx::query_as::<_, CashoutRequest>(
            r#"
            UPDATE cashout_requests SET status = 'succeeded', updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'initiated')
            RETURNING *
            "#,
        )
        .bind(payload.reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cashout) = updated else {
            return self
                .note_redelivery(payload.reference, CashoutStatus::Succeeded)
                .await;
        };

        // The committed points cost and the reserved cash both leave the
        // wallet, atomically with the status flip.
        self.wallet
            .deduct_points(&mut *tx, cashout.user_id, cashout.points_used)
            .await
            .map_err(|err| {
                CoreError::Internal(anyhow!(
                    "settlement of cashout {} could not deduct points: {err}",
                    cashout.id
                ))
            })?;
        self.wallet
            .settle_locked_cash(&mut *tx, cashout.user_id, cashout.cash_amount)
            .await?;

        sqlx::query(
            r#"
            UPDATE payout_transactions
            SET status = 'succeeded', gateway_txn_id = COALESCE($2, gateway_txn_id),
                raw_payload = $3, processed_at = $4, updated_at = now()
            WHERE cashout_id = $1
            "#,
        )
        .bind(cashout.id)
        .bind(&payload.gateway_txn_id)
        .bind(&payload.raw_payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(cashout = %cashout.id, amount = %cashout.cash_amount, "cashout settled");
        Ok(())
    }

    async fn apply_failure(
        &self,
        payload: PayoutWebhookPayload,
        outcome: WebhookOutcome,
    ) -> Result<(), CoreError> {
        let reason = payload
            .failure_reason
            .clone()
            .unwrap_or_else(|| format!("gateway reported {}", payload.status));

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_as::<_, CashoutRequest>(
            r#"
            UPDATE cashout_requests SET status = 'failed', failure_reason = $2, updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'initiated')
            RETURNING *
            "#,
        )
        .bind(payload.reference)
        .bind(&reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cashout) = updated else {
            return self
                .note_redelivery(payload.reference, CashoutStatus::Failed)
                .await;
        };

        self.wallet
            .unlock_cash(&mut *tx, cashout.user_id, cashout.cash_amount)
            .await?;

        let txn_status = match outcome {
            WebhookOutcome::Cancelled => PayoutTxnStatus::Cancelled,
            _ => PayoutTxnStatus::Failed,
        };
        sqlx::query(
            r#"
            UPDATE payout_transactions
            SET status = $2, gateway_txn_id = COALESCE($3, gateway_txn_id),
                raw_payload = $4, failure_reason = $5, processed_at = $6, updated_at = now()
            WHERE cashout_id = $1
            "#,
        )
        .bind(cashout.id)
        .bind(txn_status)
        .bind(&payload.gateway_txn_id)
        .bind(&payload.raw_payload)
        .bind(&reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        warn!(cashout = %cashout.id, %reason, "cashout failed, cash unlocked");
        Ok(())
    }

    /// A terminal webhook whose guard matched no row: either an idempotent
    /// re-delivery (no-op) or a genuine conflict (logged, never guessed).
    async fn note_redelivery(&self, reference: Uuid, applied: CashoutStatus) -> Result<(), CoreError> {
        match self.current_status(reference).await? {
            None => Err(CoreError::NotFound("cashout request")),
            Some(status) if status == applied => {
                debug!(cashout = %reference, status = %status, "duplicate terminal webhook, no-op");
                Ok(())
            }
            Some(status) => {
                error!(
                    cashout = %reference,
                    current = %status,
                    reported = %applied,
                    "conflicting terminal webhook ignored"
                );
                Ok(())
            }
        }
    }

    /// Degrade an initiate-claimed request to `failed` and release the cash.
    async fn fail_open_request(
        &self,
        cashout_id: Uuid,
        reason: &str,
    ) -> Result<CashoutRequest, CoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, CashoutRequest>(
            r#"
            UPDATE cashout_requests SET status = 'failed', failure_reason = $2, updated_at = now()
            WHERE id = $1 AND status = 'initiated'
            RETURNING *
            "#,
        )
        .bind(cashout_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(cashout) = updated else {
            // A webhook beat us to a terminal state; leave its result alone.
            return self
                .get(cashout_id)
                .await?
                .ok_or(CoreError::NotFound("cashout request"));
        };

        self.wallet
            .unlock_cash(&mut *tx, cashout.user_id, cashout.cash_amount)
            .await?;
        sqlx::query(
            r#"
            UPDATE payout_transactions
            SET status = 'failed', failure_reason = $2, processed_at = $3, updated_at = now()
            WHERE cashout_id = $1
            "#,
        )
        .bind(cashout.id)
        .bind(reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(cashout)
    }

    async fn current_status(&self, cashout_id: Uuid) -> Result<Option<CashoutStatus>, CoreError> {
        let status: Option<(CashoutStatus,)> =
            sqlx::query_as("SELECT status FROM cashout_requests WHERE id = $1")
                .bind(cashout_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.map(|(status,)| status))
    }
}

fn duplicate_or_db(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.constraint() == Some("cashout_requests_open_per_user") {
            return CoreError::DuplicatePendingRequest;
        }
    }
    CoreError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn thousand_points_convert_to_ten_dollars() {
        assert_eq!(cash_value(1000, Decimal::new(1, 2)), dec("10.00"));
        assert_eq!(cash_value(1, Decimal::new(1, 2)), dec("0.01"));
        assert_eq!(cash_value(12345, Decimal::new(1, 2)), dec("123.45"));
    }

    #[test]
    fn bounds_reject_outside_the_window() {
        let min = dec("5.00");
        let max = dec("1000.00");

        assert!(validate_bounds(dec("4.99"), min, max).is_err());
        assert!(validate_bounds(dec("5.00"), min, max).is_ok());
        assert!(validate_bounds(dec("1000.00"), min, max).is_ok());
        assert!(validate_bounds(dec("1000.01"), min, max).is_err());
    }

    #[test]
    fn gateway_statuses_map_per_contract() {
        assert_eq!(map_gateway_status("succeeded"), Some(WebhookOutcome::Succeeded));
        assert_eq!(map_gateway_status("FAILED"), Some(WebhookOutcome::Failed));
        assert_eq!(map_gateway_status("cancelled"), Some(WebhookOutcome::Cancelled));
        assert_eq!(map_gateway_status("canceled"), Some(WebhookOutcome::Cancelled));
        assert_eq!(map_gateway_status(" processing "), Some(WebhookOutcome::Processing));
    }

    #[test]
    fn unknown_gateway_statuses_are_not_guessed() {
        assert_eq!(map_gateway_status("on_hold"), None);
        assert_eq!(map_gateway_status(""), None);
        assert_eq!(map_gateway_status("refunded"), None);
    }
}

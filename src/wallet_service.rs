//! Wallet ledger: the only legal mutator of wallet balances.
//!
//! Every mutation is a single guarded UPDATE whose WHERE clause encodes the
//! resource precondition. Postgres row locking serializes concurrent writers
//! on the same wallet, and a guard that does not hold affects zero rows,
//! which maps to the specific resource error without ever writing. Callers
//! pass their own executor so a mutation can join the caller's transaction.

use anyhow::anyhow;
use rust_decimal::Decimal;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::Wallet;

pub struct WalletService {
    pool: PgPool,
}

impl WalletService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current balances, creating the zeroed wallet on first touch.
    pub async fn get_or_create(&self, user_id: Uuid) -> Result<Wallet, CoreError> {
        self.ensure_exists(&self.pool, user_id).await?;

        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(wallet)
    }

    pub async fn ensure_exists<'e, E>(&self, executor: E, user_id: Uuid) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id, points_balance, cash_balance, locked_amount, created_at, updated_at)
            VALUES ($1, $2, 0, 0, 0, now(), now())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Credit points. Upserts so a first credit also creates the wallet.
    pub async fn add_points<'e, E>(&self, executor: E, user_id: Uuid, points: i64) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        if points <= 0 {
            return Err(CoreError::NonPositiveAmount);
        }

        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id, points_balance, cash_balance, locked_amount, created_at, updated_at)
            VALUES ($1, $2, $3, 0, 0, now(), now())
            ON CONFLICT (user_id) DO UPDATE
            SET points_balance = wallets.points_balance + EXCLUDED.points_balance, updated_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(points)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn deduct_points<'e, E>(&self, executor: E, user_id: Uuid, points: i64) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        if points <= 0 {
            return Err(CoreError::NonPositiveAmount);
        }

        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET points_balance = points_balance - $2, updated_at = now()
            WHERE user_id = $1 AND points_balance >= $2
            "#,
        )
        .bind(user_id)
        .bind(points)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InsufficientPoints);
        }
        Ok(())
    }

    /// Credit redeemable cash value. Upserts like `add_points`.
    pub async fn add_cash<'e, E>(&self, executor: E, user_id: Uuid, amount: Decimal) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        if amount <= Decimal::ZERO {
            return Err(CoreError::NonPositiveAmount);
        }

        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id, points_balance, cash_balance, locked_amount, created_at, updated_at)
            VALUES ($1, $2, 0, $3, 0, now(), now())
            ON CONFLICT (user_id) DO UPDATE
            SET cash_balance = wallets.cash_balance + EXCLUDED.cash_balance, updated_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Reserve cash from the available balance (cash minus already locked).
    pub async fn lock_cash<'e, E>(&self, executor: E, user_id: Uuid, amount: Decimal) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        if amount <= Decimal::ZERO {
            return Err(CoreError::NonPositiveAmount);
        }

        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET locked_amount = locked_amount + $2, updated_at = now()
            WHERE user_id = $1 AND cash_balance - locked_amount >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InsufficientAvailableCash);
        }
        Ok(())
    }

    /// Release a reservation after a cancelled or failed payout.
    pub async fn unlock_cash<'e, E>(&self, executor: E, user_id: Uuid, amount: Decimal) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        if amount <= Decimal::ZERO {
            return Err(CoreError::NonPositiveAmount);
        }

        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET locked_amount = locked_amount - $2, updated_at = now()
            WHERE user_id = $1 AND locked_amount >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::OverUnlock);
        }
        Ok(())
    }

    /// Finalize a successful payout: the locked cash leaves the system.
    /// A failing guard here means the books are inconsistent, which is a
    /// fatal error rather than a user-facing one.
    pub async fn settle_locked_cash<'e, E>(
        &self,
        executor: E,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<(), CoreError>
    where
        E: PgExecutor<'e>,
    {
        if amount <= Decimal::ZERO {
            return Err(CoreError::NonPositiveAmount);
        }

        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET locked_amount = locked_amount - $2, cash_balance = cash_balance - $2, updated_at = now()
            WHERE user_id = $1 AND locked_amount >= $2 AND cash_balance >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(executor)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Internal(anyhow!(
                "settlement of {amount} exceeds locked funds for user {user_id}"
            )));
        }
        Ok(())
    }
}

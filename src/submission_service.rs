//! Submission ledger - intake, moderation decisions, and lifecycle state.
//!
//! Every transition is a guarded UPDATE that checks the current status in
//! its WHERE clause and writes the audit event in the same transaction, so
//! concurrent conflicting transitions serialize on the row lock and the
//! loser observes zero affected rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::cashout_service::cash_value;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::events;
use crate::geo::GeoService;
use crate::models::{
    CreateSubmissionRequest, Submission, SubmissionDetail, SubmissionEventKind, SubmissionStatus,
    UserRole,
};
use crate::storage::Storage;
use crate::verification_worker::JobQueue;
use crate::wallet_service::WalletService;

const SIGNED_URL_TTL: Duration = Duration::from_secs(600);

pub struct SubmissionService {
    pool: PgPool,
    geo: Arc<GeoService>,
    storage: Arc<dyn Storage>,
    wallet: Arc<WalletService>,
    queue: JobQueue,
    config: Arc<AppConfig>,
}

impl SubmissionService {
    pub fn new(
        pool: PgPool,
        geo: Arc<GeoService>,
        storage: Arc<dyn Storage>,
        wallet: Arc<WalletService>,
        queue: JobQueue,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            pool,
            geo,
            storage,
            wallet,
            queue,
            config,
        }
    }

    /// Intake: validate, persist as `queued`, and enqueue verification.
    pub async fn create(
        &self,
        user: &AuthenticatedUser,
        request: CreateSubmissionRequest,
    ) -> Result<Submission, CoreError> {
        validate_recorded_at(request.recorded_at, Utc::now(), self.config.capture_max_age_hours)?;

        let point = self
            .geo
            .find_nearest_active(request.latitude, request.longitude)
            .await?
            .ok_or(CoreError::LocationOutOfRange)?;

        let (today,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM submissions WHERE user_id = $1 AND created_at >= date_trunc('day', now())",
        )
        .bind(user.user_id)
        .fetch_one(&self.pool)
        .await?;
        if today >= self.config.daily_submission_limit {
            return Err(CoreError::RateLimitExceeded(self.config.daily_submission_limit));
        }

        let mut tx = self.pool.begin().await?;
        ensure_user(&mut *tx, user.user_id, user.role).await?;

        let submission = sqlx::query_as::<_, Submission>(
            r#"
            INSERT INTO submissions (
                id, user_id, media_key, latitude, longitude, recorded_at,
                collection_point_id, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', now(), now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user.user_id)
        .bind(&request.media_key)
        .bind(request.latitude)
        .bind(request.longitude)
        .bind(request.recorded_at)
        .bind(point.id)
        .fetch_one(&mut *tx)
        .await?;

        events::record(
            &mut *tx,
            submission.id,
            Some(user.user_id),
            SubmissionEventKind::Created,
            json!({
                "collection_point_id": point.id,
                "device_fingerprint": request.device_fingerprint,
            }),
        )
        .await?;
        tx.commit().await?;

        // At-least-once: a dropped enqueue is recovered by the requeue
        // scanner, and the worker is idempotent per submission id.
        self.queue.enqueue(submission.id);

        info!(submission_id = %submission.id, collection_point = %point.id, "submission queued");
        Ok(submission)
    }

    /// Moderator approval; credits the wallet at most once per submission.
    pub async fn approve(
        &self,
        submission_id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Submission, CoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Submission>(
            r#"
            UPDATE submissions SET status = 'approved', updated_at = now()
            WHERE id = $1 AND status IN ('auto_verified', 'needs_review')
            RETURNING *
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(submission) = updated else {
            return Err(transition_conflict(&mut tx, submission_id, SubmissionStatus::Approved).await?);
        };

        events::record(
            &mut *tx,
            submission.id,
            Some(actor_id),
            SubmissionEventKind::Approved,
            json!({ "reason": reason }),
        )
        .await?;
        credit_points_once(&mut tx, &self.wallet, &self.config, &submission, Some(actor_id)).await?;
        tx.commit().await?;

        info!(submission_id = %submission.id, actor = %actor_id, "submission approved");
        Ok(submission)
    }

    /// Moderator rejection; requires a non-empty reason.
    pub async fn reject(
        &self,
        submission_id: Uuid,
        actor_id: Uuid,
        reason: String,
    ) -> Result<Submission, CoreError> {
        if reason.trim().is_empty() {
            return Err(CoreError::MissingReason);
        }

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Submission>(
            r#"
            UPDATE submissions SET status = 'rejected', rejection_reason = $2, updated_at = now()
            WHERE id = $1 AND status IN ('auto_verified', 'needs_review')
            RETURNING *
            "#,
        )
        .bind(submission_id)
        .bind(&reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(submission) = updated else {
            return Err(transition_conflict(&mut tx, submission_id, SubmissionStatus::Rejected).await?);
        };

        events::record(
            &mut *tx,
            submission.id,
            Some(actor_id),
            SubmissionEventKind::Rejected,
            json!({ "reason": reason }),
        )
        .await?;
        tx.commit().await?;

        info!(submission_id = %submission.id, actor = %actor_id, "submission rejected");
        Ok(submission)
    }

    /// Delete a submission that has not been decided yet. The owning user
    /// (or a moderator) may delete while `queued` or `needs_review`; the
    /// event trail cascades in the same statement. Media cleanup is
    /// best-effort and never blocks the ledger delete.
    pub async fn delete(&self, submission_id: Uuid, caller: &AuthenticatedUser) -> Result<(), CoreError> {
        let existing = self
            .get(submission_id)
            .await?
            .ok_or(CoreError::NotFound("submission"))?;
        if existing.user_id != caller.user_id && !caller.can_moderate() {
            return Err(CoreError::Forbidden);
        }

        let deleted = sqlx::query_as::<_, Submission>(
            "DELETE FROM submissions WHERE id = $1 AND status IN ('queued', 'needs_review') RETURNING *",
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(deleted) = deleted else {
            return Err(CoreError::InvalidStateTransition {
                entity: "submission",
                from: existing.status.to_string(),
                to: "deleted".to_string(),
            });
        };

        let storage = self.storage.clone();
        tokio::spawn(async move {
            if let Err(err) = storage.delete(&deleted.media_key).await {
                warn!(key = %deleted.media_key, error = %err, "media delete failed, object orphaned");
            }
            if let Some(thumbnail_key) = &deleted.thumbnail_key {
                if let Err(err) = storage.delete(thumbnail_key).await {
                    warn!(key = %thumbnail_key, error = %err, "thumbnail delete failed, object orphaned");
                }
            }
        });

        info!(submission_id = %submission_id, "submission deleted");
        Ok(())
    }

    pub async fn get(&self, submission_id: Uuid) -> Result<Option<Submission>, CoreError> {
        let submission = sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(submission)
    }

    /// Detail view with audit trail and short-lived media links.
    pub async fn get_detail(
        &self,
        submission_id: Uuid,
        caller: &AuthenticatedUser,
    ) -> Result<SubmissionDetail, CoreError> {
        let submission = self
            .get(submission_id)
            .await?
            .ok_or(CoreError::NotFound("submission"))?;
        if submission.user_id != caller.user_id && !caller.can_moderate() {
            return Err(CoreError::Forbidden);
        }

        let events = events::trail(&self.pool, submission_id).await?;

        let media_url = self.signed_url_or_log(&submission.media_key).await;
        let thumbnail_url = match &submission.thumbnail_key {
            Some(key) => self.signed_url_or_log(key).await,
            None => None,
        };

        Ok(SubmissionDetail {
            submission,
            media_url,
            thumbnail_url,
            events,
        })
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Submission>, CoreError> {
        let submissions = sqlx::query_as::<_, Submission>(
            "SELECT * FROM submissions WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(submissions)
    }

    /// Moderation queue: everything awaiting a decision or still unverified,
    /// oldest first.
    pub async fn moderation_queue(&self, limit: i64, offset: i64) -> Result<Vec<Submission>, CoreError> {
        let submissions = sqlx::query_as::<_, Submission>(
            r#"
            SELECT * FROM submissions
            WHERE status IN ('needs_review', 'queued')
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(submissions)
    }

    async fn signed_url_or_log(&self, key: &str) -> Option<String> {
        match self.storage.signed_url(key, SIGNED_URL_TTL).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(key, error = %err, "signed url unavailable");
                None
            }
        }
    }
}

/// Anchor row for foreign keys; account management is the auth service's job.
pub(crate) async fn ensure_user<'e, E>(executor: E, user_id: Uuid, role: UserRole) -> Result<(), CoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query("INSERT INTO users (id, role, created_at) VALUES ($1, $2, now()) ON CONFLICT (id) DO NOTHING")
        .bind(user_id)
        .bind(role)
        .execute(executor)
        .await?;
    Ok(())
}

/// Award rule: base points, plus the bonus when the auto-score cleared the
/// bonus threshold.
pub fn points_award(auto_score: Option<i32>, config: &AppConfig) -> i64 {
    let mut points = config.base_award_points;
    if auto_score.is_some_and(|score| score > config.bonus_score_threshold) {
        points += config.bonus_award_points;
    }
    points
}

/// Capture must not be from the future nor older than the acceptance window.
pub fn validate_recorded_at(
    recorded_at: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age_hours: i64,
) -> Result<(), CoreError> {
    if recorded_at > now || recorded_at < now - chrono::Duration::hours(max_age_hours) {
        return Err(CoreError::StaleOrFutureCapture);
    }
    Ok(())
}

/// Credit the award exactly once per submission. The `points_credited` event
/// is the idempotency guard; the caller must already hold the submission row
/// lock (a guarded UPDATE or SELECT ... FOR UPDATE) so two crediting paths
/// cannot pass the guard concurrently. Crediting also realizes the points'
/// redeemable cash value so a later cashout has real cash to lock.
pub(crate) async fn credit_points_once(
    tx: &mut Transaction<'_, Postgres>,
    wallet: &WalletService,
    config: &AppConfig,
    submission: &Submission,
    actor_id: Option<Uuid>,
) -> Result<bool, CoreError> {
    if events::has_event(&mut **tx, submission.id, SubmissionEventKind::PointsCredited).await? {
        return Ok(false);
    }

    let points = points_award(submission.auto_score, config);
    let cash = cash_value(points, config.cashout_rate);

    wallet.add_points(&mut **tx, submission.user_id, points).await?;
    wallet.add_cash(&mut **tx, submission.user_id, cash).await?;

    events::record(
        &mut **tx,
        submission.id,
        actor_id,
        SubmissionEventKind::PointsCredited,
        json!({ "points": points, "cash_value": cash.to_string() }),
    )
    .await?;

    info!(submission_id = %submission.id, points, "points credited");
    Ok(true)
}

/// Build the conflict error for a transition whose guard matched no row.
async fn transition_conflict(
    tx: &mut Transaction<'_, Postgres>,
    submission_id: Uuid,
    to: SubmissionStatus,
) -> Result<CoreError, CoreError> {
    let current: Option<(SubmissionStatus,)> =
        sqlx::query_as("SELECT status FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&mut **tx)
            .await?;

    Ok(match current {
        None => CoreError::NotFound("submission"),
        Some((status,)) => CoreError::InvalidStateTransition {
            entity: "submission",
            from: status.to_string(),
            to: to.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig::from_env()
    }

    #[test]
    fn capture_window_bounds() {
        let now = Utc::now();
        assert!(validate_recorded_at(now, now, 24).is_ok());
        assert!(validate_recorded_at(now - chrono::Duration::hours(1), now, 24).is_ok());
        // Exactly 24 hours old is still inside the window.
        assert!(validate_recorded_at(now - chrono::Duration::hours(24), now, 24).is_ok());

        assert!(validate_recorded_at(now + chrono::Duration::minutes(1), now, 24).is_err());
        assert!(validate_recorded_at(now - chrono::Duration::hours(25), now, 24).is_err());
    }

    #[test]
    fn award_is_base_plus_bonus_above_threshold() {
        let config = config();
        assert_eq!(points_award(None, &config), 100);
        assert_eq!(points_award(Some(70), &config), 100);
        // Threshold is strict: exactly 80 earns no bonus.
        assert_eq!(points_award(Some(80), &config), 100);
        assert_eq!(points_award(Some(81), &config), 150);
        assert_eq!(points_award(Some(90), &config), 150);
    }
}

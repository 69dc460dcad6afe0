//! Asynchronous verification pipeline.
//!
//! One job per submission id flows through: fetch media, probe, thumbnail +
//! fingerprint, score, transition. Transient failures re-enqueue with
//! exponential backoff up to a bounded attempt count; non-transient failures
//! park the submission for human review instead of losing it. Re-processing
//! an id that already left `queued` is a no-op, except that an
//! `auto_verified` row missing its credit (a crash between transition and
//! commit of a split flow) gets the credit completed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::events;
use crate::media::{fingerprint_hex, seek_point, MediaInfo, MediaProcessor};
use crate::models::{Submission, SubmissionEventKind, SubmissionStatus};
use crate::storage::Storage;
use crate::submission_service::credit_points_once;
use crate::wallet_service::WalletService;

#[derive(Debug, Clone, Copy)]
pub struct VerificationJob {
    pub submission_id: Uuid,
    pub attempt: u32,
}

/// Explicit queue handle injected into intake and the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<VerificationJob>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<VerificationJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, submission_id: Uuid) {
        self.submit(VerificationJob {
            submission_id,
            attempt: 0,
        });
    }

    pub fn submit(&self, job: VerificationJob) {
        if let Err(err) = self.tx.try_send(job) {
            // The requeue scanner recovers anything dropped here.
            warn!(error = %err, "verification queue refused job");
        }
    }

    pub fn submit_after(&self, job: VerificationJob, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = tx.send(job).await {
                warn!(error = %err, "verification queue closed while re-enqueueing");
            }
        });
    }
}

enum StepError {
    Transient(anyhow::Error),
    Permanent(String),
}

fn transient<E: Into<anyhow::Error>>(err: E) -> StepError {
    StepError::Transient(err.into())
}

pub struct VerificationWorker {
    pool: PgPool,
    storage: Arc<dyn Storage>,
    media: Arc<dyn MediaProcessor>,
    wallet: Arc<WalletService>,
    queue: JobQueue,
    config: Arc<AppConfig>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl VerificationWorker {
    pub fn new(
        pool: PgPool,
        storage: Arc<dyn Storage>,
        media: Arc<dyn MediaProcessor>,
        wallet: Arc<WalletService>,
        queue: JobQueue,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            pool,
            storage,
            media,
            wallet,
            queue,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, submission_id: Uuid) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .insert(submission_id)
    }

    fn release(&self, submission_id: Uuid) {
        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(&submission_id);
    }

    async fn run_job(&self, job: VerificationJob) {
        let deadline = Duration::from_secs(self.config.job_timeout_secs);
        match tokio::time::timeout(deadline, self.process(job.submission_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(StepError::Permanent(reason))) => {
                warn!(submission_id = %job.submission_id, %reason, "verification failed permanently");
                if let Err(err) = self.park_for_review(job.submission_id, &reason).await {
                    error!(submission_id = %job.submission_id, error = %err, "failed to park submission for review");
                }
            }
            Ok(Err(StepError::Transient(err))) => {
                self.retry_or_park(job, err.to_string()).await;
            }
            Err(_) => {
                self.retry_or_park(job, format!("timed out after {}s", deadline.as_secs()))
                    .await;
            }
        }
    }

    async fn retry_or_park(&self, job: VerificationJob, reason: String) {
        let next_attempt = job.attempt + 1;
        if next_attempt >= self.config.max_job_attempts {
            warn!(submission_id = %job.submission_id, attempts = next_attempt, %reason, "verification retries exhausted");
            let parked = format!("verification gave up after {next_attempt} attempts: {reason}");
            if let Err(err) = self.park_for_review(job.submission_id, &parked).await {
                error!(submission_id = %job.submission_id, error = %err, "failed to park submission for review");
            }
            return;
        }

        let delay = backoff_delay(next_attempt, Duration::from_millis(self.config.retry_base_delay_ms));
        warn!(
            submission_id = %job.submission_id,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "transient verification failure, retrying"
        );
        self.queue.submit_after(
            VerificationJob {
                submission_id: job.submission_id,
                attempt: next_attempt,
            },
            delay,
        );
    }

    async fn process(&self, submission_id: Uuid) -> Result<(), StepError> {
        let submission = sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = $1")
            .bind(submission_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;

        let Some(submission) = submission else {
            debug!(%submission_id, "submission deleted before verification");
            return Ok(());
        };

        match submission.status {
            SubmissionStatus::Queued => {}
            SubmissionStatus::AutoVerified => return self.ensure_credited(&submission).await,
            _ => return Ok(()),
        }

        let bytes = self
            .storage
            .fetch(&submission.media_key)
            .await
            .map_err(StepError::Transient)?;

        let info = self
            .media
            .probe(&bytes)
            .await
            .map_err(|err| StepError::Permanent(format!("probe failed: {err}")))?;

        let at = seek_point(info.duration_secs);
        let frame = self
            .media
            .still_frame(&bytes, at)
            .await
            .map_err(|err| StepError::Permanent(format!("thumbnail failed: {err}")))?;
        let dhash = self
            .media
            .frame_dhash(&bytes, at)
            .await
            .map_err(|err| StepError::Permanent(format!("fingerprint failed: {err}")))?;

        let thumbnail_key = self
            .storage
            .store(frame, "image/jpeg")
            .await
            .map_err(StepError::Transient)?;

        sqlx::query(
            r#"
            UPDATE submissions
            SET thumbnail_key = $2, duration_secs = $3, size_bytes = $4,
                width = $5, height = $6, codec = $7, fingerprint = $8, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(submission.id)
        .bind(&thumbnail_key)
        .bind(info.duration_secs)
        .bind(info.size_bytes)
        .bind(info.width)
        .bind(info.height)
        .bind(&info.codec)
        .bind(fingerprint_hex(dhash))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        let score = compute_auto_score(&info);
        self.finish(&submission, score).await
    }

    /// Apply the scored outcome. The guard on `queued` makes re-processing
    /// after a partial failure a no-op.
    async fn finish(&self, submission: &Submission, score: i32) -> Result<(), StepError> {
        let auto_verified = score > self.config.auto_verify_threshold;
        let (next, kind) = if auto_verified {
            (SubmissionStatus::AutoVerified, SubmissionEventKind::AutoVerified)
        } else {
            (SubmissionStatus::NeedsReview, SubmissionEventKind::NeedsReview)
        };

        let mut tx = self.pool.begin().await.map_err(transient)?;
        let updated = sqlx::query_as::<_, Submission>(
            r#"
            UPDATE submissions SET status = $2, auto_score = $3, updated_at = now()
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(submission.id)
        .bind(next)
        .bind(score)
        .fetch_optional(&mut *tx)
        .await
        .map_err(transient)?;

        let Some(updated) = updated else {
            debug!(submission_id = %submission.id, "submission left queued state during verification");
            return Ok(());
        };

        events::record(&mut *tx, updated.id, None, kind, json!({ "auto_score": score }))
            .await
            .map_err(transient)?;

        if auto_verified {
            credit_points_once(&mut tx, &self.wallet, &self.config, &updated, None)
                .await
                .map_err(core_transient)?;
        }

        tx.commit().await.map_err(transient)?;
        info!(submission_id = %updated.id, score, status = %updated.status, "verification complete");
        Ok(())
    }

    /// Crash recovery: an `auto_verified` submission whose credit never
    /// committed gets exactly the missing credit, nothing else.
    async fn ensure_credited(&self, submission: &Submission) -> Result<(), StepError> {
        let mut tx = self.pool.begin().await.map_err(transient)?;

        // Row lock serializes against a concurrent moderator decision.
        let locked = sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = $1 FOR UPDATE")
            .bind(submission.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?;

        let Some(locked) = locked else {
            return Ok(());
        };
        if locked.status == SubmissionStatus::AutoVerified {
            let credited = credit_points_once(&mut tx, &self.wallet, &self.config, &locked, None)
                .await
                .map_err(core_transient)?;
            if credited {
                info!(submission_id = %locked.id, "recovered missing point credit");
            }
        }

        tx.commit().await.map_err(transient)?;
        Ok(())
    }

    async fn park_for_review(&self, submission_id: Uuid, reason: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Submission>(
            r#"
            UPDATE submissions SET status = 'needs_review', updated_at = now()
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(updated) = updated {
            events::record(
                &mut *tx,
                updated.id,
                None,
                SubmissionEventKind::NeedsReview,
                json!({ "reason": reason, "system": true }),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn core_transient(err: CoreError) -> StepError {
    StepError::Transient(anyhow::Error::new(err))
}

/// Dispatch loop: bounded concurrency, at most one in-flight attempt per
/// submission id.
pub async fn run(worker: Arc<VerificationWorker>, mut rx: mpsc::Receiver<VerificationJob>) {
    let permits = Arc::new(Semaphore::new(worker.config.worker_concurrency));
    info!(concurrency = worker.config.worker_concurrency, "verification worker pool started");

    while let Some(job) = rx.recv().await {
        if !worker.claim(job.submission_id) {
            // An attempt for this id is still running; try again shortly.
            worker.queue.submit_after(job, Duration::from_secs(2));
            continue;
        }

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let worker = worker.clone();
        tokio::spawn(async move {
            let submission_id = job.submission_id;
            worker.run_job(job).await;
            worker.release(submission_id);
            drop(permit);
        });
    }

    info!("verification queue closed, worker pool stopping");
}

/// Background sweep: re-enqueue `queued` submissions whose job was lost
/// (process crash, queue overflow). Delivery is at-least-once; the worker's
/// state guards make duplicates harmless.
pub async fn requeue_scanner(pool: PgPool, queue: JobQueue, scan_interval: Duration, stale_after: Duration) {
    info!(interval_secs = scan_interval.as_secs(), "requeue scanner started");

    loop {
        tokio::time::sleep(scan_interval).await;

        let stale = sqlx::query_as::<_, (Uuid,)>(
            "SELECT id FROM submissions WHERE status = 'queued' AND updated_at < now() - make_interval(secs => $1)",
        )
        .bind(stale_after.as_secs_f64())
        .fetch_all(&pool)
        .await;

        match stale {
            Ok(rows) => {
                if !rows.is_empty() {
                    info!(count = rows.len(), "re-enqueueing stale queued submissions");
                }
                for (submission_id,) in rows {
                    queue.enqueue(submission_id);
                }
            }
            Err(err) => error!(error = %err, "requeue scan failed"),
        }
    }
}

/// Deterministic heuristic score, scaled to 0-100. A future classifier is a
/// drop-in replacement behind the same contract.
pub fn compute_auto_score(info: &MediaInfo) -> i32 {
    const MB: i64 = 1024 * 1024;

    let mut score: f64 = 0.5;
    if (10.0..=60.0).contains(&info.duration_secs) {
        score += 0.2;
    }
    if info.duration_secs < 5.0 {
        score -= 0.3;
    }
    if info.width >= 1280 && info.height >= 720 {
        score += 0.1;
    }
    if (MB..=50 * MB).contains(&info.size_bytes) {
        score += 0.1;
    }
    if info.size_bytes > 100 * MB {
        score -= 0.2;
    }

    (score.clamp(0.0, 1.0) * 100.0).round() as i32
}

/// Exponential backoff with a small jitter, capped at 2^5 times the base.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(5));
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..=250))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: i64 = 1024 * 1024;

    fn clip(duration_secs: f64, size_bytes: i64, width: i32, height: i32) -> MediaInfo {
        MediaInfo {
            duration_secs,
            size_bytes,
            width,
            height,
            codec: "h264".to_string(),
        }
    }

    #[test]
    fn good_capture_scores_ninety() {
        // 45s, 20MB, 1080p: base 0.5 + 0.2 + 0.1 + 0.1.
        let score = compute_auto_score(&clip(45.0, 20 * MB, 1920, 1080));
        assert_eq!(score, 90);
    }

    #[test]
    fn short_clip_is_penalized() {
        // 3s, 2MB, low-res: 0.5 - 0.3 + 0.1.
        let score = compute_auto_score(&clip(3.0, 2 * MB, 640, 480));
        assert_eq!(score, 30);
    }

    #[test]
    fn oversized_upload_is_penalized() {
        // 30s, 200MB, 1080p: 0.5 + 0.2 + 0.1 - 0.2.
        let score = compute_auto_score(&clip(30.0, 200 * MB, 1920, 1080));
        assert_eq!(score, 60);
    }

    #[test]
    fn score_clamps_at_zero() {
        // 2s, 200MB, low-res: 0.5 - 0.3 - 0.2.
        let score = compute_auto_score(&clip(2.0, 200 * MB, 320, 240));
        assert_eq!(score, 0);
    }

    #[test]
    fn duration_and_size_boundaries_are_inclusive() {
        assert_eq!(compute_auto_score(&clip(10.0, MB, 640, 480)), 80);
        assert_eq!(compute_auto_score(&clip(60.0, 50 * MB, 640, 480)), 80);
        // 100MB is not yet oversized.
        assert_eq!(compute_auto_score(&clip(30.0, 100 * MB, 640, 480)), 70);
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let base = Duration::from_millis(500);
        for attempt in 1..8 {
            let delay = backoff_delay(attempt, base);
            let floor = base * (1 << attempt.min(5));
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_millis(250));
        }
    }
}

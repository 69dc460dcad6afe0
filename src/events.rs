//! Append-only audit trail for submissions.
//!
//! Writers pass their own executor so an event always commits in the same
//! transaction as the state change it records.

use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{SubmissionEvent, SubmissionEventKind};

/// Append one audit fact.
pub async fn record<'e, E>(
    executor: E,
    submission_id: Uuid,
    actor_id: Option<Uuid>,
    kind: SubmissionEventKind,
    metadata: serde_json::Value,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO submission_events (id, submission_id, actor_id, kind, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, now())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(submission_id)
    .bind(actor_id)
    .bind(kind)
    .bind(metadata)
    .execute(executor)
    .await?;

    Ok(())
}

/// Whether an event of the given kind was already recorded. Used as the
/// idempotency guard for one-shot effects such as point crediting.
pub async fn has_event<'e, E>(
    executor: E,
    submission_id: Uuid,
    kind: SubmissionEventKind,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM submission_events WHERE submission_id = $1 AND kind = $2)",
    )
    .bind(submission_id)
    .bind(kind)
    .fetch_one(executor)
    .await?;

    Ok(exists)
}

/// Full trail for a submission, oldest first.
pub async fn trail(pool: &PgPool, submission_id: Uuid) -> Result<Vec<SubmissionEvent>, sqlx::Error> {
    sqlx::query_as::<_, SubmissionEvent>(
        "SELECT * FROM submission_events WHERE submission_id = $1 ORDER BY created_at, id",
    )
    .bind(submission_id)
    .fetch_all(pool)
    .await
}

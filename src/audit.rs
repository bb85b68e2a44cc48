use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::PipelineError;
use crate::domain::SubmissionId;
use crate::tracker::SqliteTx;

/// Appends an audit row. Audit writes are allowed against terminal
/// submissions; they are the one mutation the freeze does not cover.
pub async fn record(
    tx: &mut SqliteTx,
    submission_id: Option<&SubmissionId>,
    tenant: &str,
    action: &str,
    detail: Option<&str>,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO audit_log (submission_id, tenant, action, detail, month, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(submission_id.map(|id| id.as_ref()))
    .bind(tenant)
    .bind(action)
    .bind(detail)
    .bind(now.format("%Y%m").to_string())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn record_pool(
    pool: &SqlitePool,
    submission_id: Option<&SubmissionId>,
    tenant: &str,
    action: &str,
    detail: Option<&str>,
) -> Result<(), PipelineError> {
    let mut tx = pool.begin().await?;
    record(&mut tx, submission_id, tenant, action, detail).await?;
    tx.commit().await?;
    Ok(())
}

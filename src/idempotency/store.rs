use chrono::DateTime;
use chrono::Utc;
use sha2::Digest;
use sha2::Sha256;
use sqlx::Row;
use sqlx::SqlitePool;

use super::IdempotencyKey;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::SubmissionId;
use crate::tracker::SqliteTx;

/// What the front-door learned from the idempotency check. Database-level
/// synchronization: the API is replicated, so an in-memory lock would not
/// help — the conditional insert is the arbiter.
pub enum NextAction {
    /// The key is fresh (or expired and taken over); proceed.
    StartProcessing,
    /// A live record exists; reply `duplicate` with no side effects.
    ReturnDuplicate(IdempotencyRecord),
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub submission_id: String,
    pub request_hash: String,
    pub response_ref: Option<ArtifactRef>,
    pub expires_at: DateTime<Utc>,
}

/// Fingerprint of the raw request body, stored so operators can tell a
/// true retry from key reuse with a different payload.
pub fn request_hash(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Atomically records the key iff no live record exists. Runs inside the
/// front-door's creation transaction: losing the insert race means some
/// concurrent request already owns the key, and this caller must return
/// `duplicate` without side effects.
#[tracing::instrument(skip_all, fields(key = %key.as_ref()))]
pub async fn check_and_set(
    tx: &mut SqliteTx,
    tenant: &str,
    key: &IdempotencyKey,
    submission_id: &SubmissionId,
    hash: &str,
    ttl: chrono::Duration,
) -> Result<NextAction, PipelineError> {
    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO idempotency
            (tenant, idempotency_key, submission_id, request_hash, created_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(tenant)
    .bind(key.as_ref())
    .bind(submission_id.as_ref())
    .bind(hash)
    .bind(now)
    .bind(now + ttl)
    .execute(&mut **tx)
    .await?;
    if inserted.rows_affected() == 1 {
        return Ok(NextAction::StartProcessing);
    }

    // an expired record behaves as absent: take it over in place
    let takeover = sqlx::query(
        "UPDATE idempotency
         SET submission_id = ?, request_hash = ?, response_bucket = NULL,
             response_key = NULL, created_at = ?, expires_at = ?
         WHERE tenant = ? AND idempotency_key = ? AND expires_at <= ?",
    )
    .bind(submission_id.as_ref())
    .bind(hash)
    .bind(now)
    .bind(now + ttl)
    .bind(tenant)
    .bind(key.as_ref())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    if takeover.rows_affected() == 1 {
        return Ok(NextAction::StartProcessing);
    }

    let prior = fetch(&mut **tx, tenant, key).await?.ok_or_else(|| {
        PipelineError::transient(anyhow::anyhow!(
            "idempotency row vanished for key {}",
            key.as_ref()
        ))
    })?;
    Ok(NextAction::ReturnDuplicate(prior))
}

/// Attaches the final response pointer so a duplicate caller can retrieve
/// the prior outcome.
pub async fn record_response(
    tx: &mut SqliteTx,
    tenant: &str,
    key: &str,
    response: &ArtifactRef,
) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE idempotency SET response_bucket = ?, response_key = ?
         WHERE tenant = ? AND idempotency_key = ?",
    )
    .bind(&response.bucket)
    .bind(&response.key)
    .bind(tenant)
    .bind(key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_record(
    pool: &SqlitePool,
    tenant: &str,
    key: &IdempotencyKey,
) -> Result<Option<IdempotencyRecord>, PipelineError> {
    fetch(pool, tenant, key).await
}

async fn fetch<'e, E>(
    executor: E,
    tenant: &str,
    key: &IdempotencyKey,
) -> Result<Option<IdempotencyRecord>, PipelineError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        "SELECT submission_id, request_hash, response_bucket, response_key, expires_at
         FROM idempotency WHERE tenant = ? AND idempotency_key = ?",
    )
    .bind(tenant)
    .bind(key.as_ref())
    .fetch_optional(executor)
    .await?;
    row.map(|r| {
        let bucket: Option<String> = r.try_get("response_bucket")?;
        let object_key: Option<String> = r.try_get("response_key")?;
        Ok(IdempotencyRecord {
            submission_id: r.try_get("submission_id")?,
            request_hash: r.try_get("request_hash")?,
            response_ref: bucket
                .zip(object_key)
                .map(|(bucket, key)| ArtifactRef { bucket, key }),
            expires_at: r.try_get("expires_at")?,
        })
    })
    .transpose()
}

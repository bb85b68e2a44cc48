use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::Transaction;

use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::Stage;
use crate::domain::SubmissionId;
use crate::domain::SubmissionStatus;

pub type SqliteTx = Transaction<'static, Sqlite>;

// Guard clause appended to every non-audit mutation: terminal rows are
// frozen (invariant: only audit timestamps may change afterwards).
const NOT_TERMINAL: &str = "AND status NOT IN \
    ('COMPLETED', 'COMPLETED_WITH_ERRORS', 'FAILED', 'CANCELLED', 'EXPIRED')";

/// Authoritative per-submission lifecycle record. The in-flight bus
/// message is the true progress token; this row is the durable shadow
/// that the status endpoint and operators read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTracker {
    pub submission_id: SubmissionId,
    pub tenant: String,
    pub source_system: Option<String>,
    pub request_type: String,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub status: SubmissionStatus,
    pub last_stage: Option<String>,
    pub next_stage: Option<String>,
    pub raw_ref: Option<ArtifactRef>,
    pub parsed_ref: Option<ArtifactRef>,
    pub enriched_ref: Option<ArtifactRef>,
    pub canonical_ref: Option<ArtifactRef>,
    pub payer_reply_ref: Option<ArtifactRef>,
    pub final_response_ref: Option<ArtifactRef>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub retry_count: i64,
    pub received_at: DateTime<Utc>,
    pub sync_processed_at: Option<DateTime<Utc>>,
    pub async_queued_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub contains_phi: bool,
    pub phi_encrypted: bool,
    pub sync_processed: bool,
    pub async_queued: bool,
    pub external_reference_id: Option<String>,
    pub payer_id: Option<String>,
}

/// Fields fixed at acceptance time.
pub struct NewTracker {
    pub submission_id: SubmissionId,
    pub tenant: String,
    pub source_system: Option<String>,
    pub request_type: String,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub raw_ref: ArtifactRef,
    pub contains_phi: bool,
    pub phi_encrypted: bool,
    pub received_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Tracker slot a stage's output artifact is recorded in.
#[derive(Debug, Clone, Copy)]
pub enum ArtifactSlot {
    Parsed,
    Enriched,
    Canonical,
    PayerReply,
    FinalResponse,
}

impl ArtifactSlot {
    fn columns(&self) -> (&'static str, &'static str) {
        match self {
            ArtifactSlot::Parsed => ("parsed_bucket", "parsed_key"),
            ArtifactSlot::Enriched => ("enriched_bucket", "enriched_key"),
            ArtifactSlot::Canonical => ("canonical_bucket", "canonical_key"),
            ArtifactSlot::PayerReply => ("payer_reply_bucket", "payer_reply_key"),
            ArtifactSlot::FinalResponse => ("final_response_bucket", "final_response_key"),
        }
    }

    /// Which slot a stage writes into, if any.
    pub fn for_stage(stage: Stage) -> Option<ArtifactSlot> {
        match stage {
            Stage::Parse => Some(ArtifactSlot::Parsed),
            Stage::Enrich => Some(ArtifactSlot::Enriched),
            Stage::Convert => Some(ArtifactSlot::Canonical),
            Stage::PayerCall => Some(ArtifactSlot::PayerReply),
            Stage::BuildResponse => Some(ArtifactSlot::FinalResponse),
            Stage::Validate | Stage::Attachments | Stage::NotifySubscribers => None,
        }
    }
}

/// Inserts the row in `RECEIVED`. Fails on a duplicate submission id
/// (primary-key uniqueness is the one-row-per-submission invariant).
#[tracing::instrument(skip_all, fields(submission_id = %tracker.submission_id))]
pub async fn create(tx: &mut SqliteTx, tracker: &NewTracker) -> Result<(), PipelineError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO request_tracker
            (submission_id, tenant, source_system, request_type,
             idempotency_key, correlation_id, status, next_stage,
             raw_bucket, raw_key, received_at, expires_at, updated_at,
             contains_phi, phi_encrypted)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tracker.submission_id.as_ref())
    .bind(&tracker.tenant)
    .bind(&tracker.source_system)
    .bind(&tracker.request_type)
    .bind(&tracker.idempotency_key)
    .bind(&tracker.correlation_id)
    .bind(SubmissionStatus::Received.as_str())
    .bind(Stage::Parse.as_str())
    .bind(&tracker.raw_ref.bucket)
    .bind(&tracker.raw_ref.key)
    .bind(tracker.received_at)
    .bind(tracker.expires_at)
    .bind(now)
    .bind(tracker.contains_phi)
    .bind(tracker.phi_encrypted)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get(
    pool: &SqlitePool,
    submission_id: &SubmissionId,
) -> Result<Option<RequestTracker>, PipelineError> {
    let row = sqlx::query("SELECT * FROM request_tracker WHERE submission_id = ?")
        .bind(submission_id.as_ref())
        .fetch_optional(pool)
        .await?;
    row.map(|r| from_row(&r)).transpose()
}

/// Status flip when a worker picks the submission up for a stage.
pub async fn mark_stage_started(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    status: SubmissionStatus,
) -> Result<(), PipelineError> {
    let sql = format!(
        "UPDATE request_tracker SET status = ?, updated_at = ? WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Advances `last_stage`/`next_stage` after a successful stage. The side
/// path never calls this (it must not advance the main path).
pub async fn mark_stage_done(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    stage: Stage,
    status: Option<SubmissionStatus>,
    next_stage: Option<Stage>,
) -> Result<(), PipelineError> {
    let sql = format!(
        "UPDATE request_tracker
         SET status = COALESCE(?, status), last_stage = ?, next_stage = ?, updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(status.map(|s| s.as_str()))
        .bind(stage.as_str())
        .bind(next_stage.map(|s| s.as_str()))
        .bind(Utc::now())
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_artifact(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    slot: ArtifactSlot,
    artifact: &ArtifactRef,
) -> Result<(), PipelineError> {
    let (bucket_col, key_col) = slot.columns();
    let sql = format!(
        "UPDATE request_tracker SET {bucket_col} = ?, {key_col} = ?, updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(&artifact.bucket)
        .bind(&artifact.key)
        .bind(Utc::now())
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Records the latest error snapshot. Passing a status moves the row into
/// that (stage-error or terminal) state; `None` leaves the status alone
/// so transient failures stay retryable.
pub async fn update_error(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    code: &str,
    message: &str,
    status: Option<SubmissionStatus>,
) -> Result<(), PipelineError> {
    let sql = format!(
        "UPDATE request_tracker
         SET last_error_code = ?, last_error_message = ?, retry_count = retry_count + 1,
             status = COALESCE(?, status), updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(code)
        .bind(message)
        .bind(status.map(|s| s.as_str()))
        .bind(Utc::now())
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Marks a terminal status and records the final response pointer. The
/// freeze guard makes this first-writer-wins.
pub async fn update_final_status(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    status: SubmissionStatus,
    stage: Stage,
    final_ref: Option<&ArtifactRef>,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE request_tracker
         SET status = ?, last_stage = ?, next_stage = NULL,
             final_response_bucket = COALESCE(?, final_response_bucket),
             final_response_key = COALESCE(?, final_response_key),
             completed_at = ?, updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(status.as_str())
        .bind(stage.as_str())
        .bind(final_ref.map(|r| r.bucket.as_str()))
        .bind(final_ref.map(|r| r.key.as_str()))
        .bind(now)
        .bind(now)
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn update_external_reference(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    external_reference_id: &str,
) -> Result<(), PipelineError> {
    let sql = format!(
        "UPDATE request_tracker SET external_reference_id = ?, updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(external_reference_id)
        .bind(Utc::now())
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn update_payer_id(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    payer_id: &str,
) -> Result<(), PipelineError> {
    let sql = format!(
        "UPDATE request_tracker SET payer_id = ?, updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(payer_id)
        .bind(Utc::now())
        .bind(submission_id.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Single-winner latch for the payer callback: flips
/// `AWAITING_CALLBACK -> SUBMITTED` for exactly one caller, so concurrent
/// callbacks cannot double-inject a resume message.
pub async fn try_begin_callback(
    pool: &SqlitePool,
    submission_id: &SubmissionId,
) -> Result<bool, PipelineError> {
    let result = sqlx::query(
        "UPDATE request_tracker SET status = ?, updated_at = ?
         WHERE submission_id = ? AND status = ?",
    )
    .bind(SubmissionStatus::Submitted.as_str())
    .bind(Utc::now())
    .bind(submission_id.as_ref())
    .bind(SubmissionStatus::AwaitingCallback.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Single-winner latch for activating the asynchronous arm: the guarded
/// update returns one affected row for exactly one caller per submission,
/// however many race.
#[tracing::instrument(skip(pool))]
pub async fn try_mark_async_queued(
    pool: &SqlitePool,
    submission_id: &SubmissionId,
) -> Result<bool, PipelineError> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE request_tracker
         SET async_queued = 1, async_queued_at = ?, updated_at = ?
         WHERE submission_id = ? AND async_queued = 0",
    )
    .bind(now)
    .bind(now)
    .bind(submission_id.as_ref())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn record_sync_processed(
    pool: &SqlitePool,
    submission_id: &SubmissionId,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE request_tracker
         SET sync_processed = 1, sync_processed_at = ?, updated_at = ?
         WHERE submission_id = ? {NOT_TERMINAL}"
    );
    sqlx::query(&sql)
        .bind(now)
        .bind(now)
        .bind(submission_id.as_ref())
        .execute(pool)
        .await?;
    Ok(())
}

fn artifact(row: &SqliteRow, bucket_col: &str, key_col: &str) -> Option<ArtifactRef> {
    let bucket: Option<String> = row.try_get(bucket_col).ok().flatten();
    let key: Option<String> = row.try_get(key_col).ok().flatten();
    match (bucket, key) {
        (Some(bucket), Some(key)) => Some(ArtifactRef { bucket, key }),
        _ => None,
    }
}

fn from_row(row: &SqliteRow) -> Result<RequestTracker, PipelineError> {
    let submission_id: String = row.try_get("submission_id")?;
    let status: String = row.try_get("status")?;
    Ok(RequestTracker {
        submission_id: SubmissionId::parse(&submission_id)
            .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?,
        tenant: row.try_get("tenant")?,
        source_system: row.try_get("source_system")?,
        request_type: row.try_get("request_type")?,
        idempotency_key: row.try_get("idempotency_key")?,
        correlation_id: row.try_get("correlation_id")?,
        status: status
            .parse()
            .map_err(|e: String| PipelineError::transient(anyhow::anyhow!(e)))?,
        last_stage: row.try_get("last_stage")?,
        next_stage: row.try_get("next_stage")?,
        raw_ref: artifact(row, "raw_bucket", "raw_key"),
        parsed_ref: artifact(row, "parsed_bucket", "parsed_key"),
        enriched_ref: artifact(row, "enriched_bucket", "enriched_key"),
        canonical_ref: artifact(row, "canonical_bucket", "canonical_key"),
        payer_reply_ref: artifact(row, "payer_reply_bucket", "payer_reply_key"),
        final_response_ref: artifact(row, "final_response_bucket", "final_response_key"),
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
        retry_count: row.try_get("retry_count")?,
        received_at: row.try_get("received_at")?,
        sync_processed_at: row.try_get("sync_processed_at")?,
        async_queued_at: row.try_get("async_queued_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
        updated_at: row.try_get("updated_at")?,
        contains_phi: row.try_get("contains_phi")?,
        phi_encrypted: row.try_get("phi_encrypted")?,
        sync_processed: row.try_get("sync_processed")?,
        async_queued: row.try_get("async_queued")?,
        external_reference_id: row.try_get("external_reference_id")?,
        payer_id: row.try_get("payer_id")?,
    })
}

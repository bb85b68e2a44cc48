use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::bus;
use crate::configuration::OutboxSettings;
use crate::configuration::PipelineSettings;
use crate::configuration::Settings;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::SubmissionId;
use crate::tracker::SqliteTx;

/// A staged outbound message, readable back for publishing.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: String,
    pub tenant: String,
    pub aggregate_id: String,
    pub destination: Stage,
    pub payload: String,
    pub retry_count: i64,
    pub max_retries: i64,
}

/// Stages `message` for `destination` inside the caller's transaction, so
/// the business mutation and the send commit or roll back together.
///
/// `hold` keeps the row away from the publisher until it elapses: the
/// bounded sync runner uses it to reserve rows it intends to execute in
/// process (it reads NEW rows regardless of `next_retry_at`). If the sync
/// path dies, the hold expires and the row drains asynchronously.
#[tracing::instrument(skip(tx, message, hold), fields(submission_id = %message.submission_id, destination = %destination))]
pub async fn write(
    tx: &mut SqliteTx,
    destination: Stage,
    message: &PipelineMessage,
    max_retries: i64,
    hold: Option<Duration>,
) -> Result<String, PipelineError> {
    let payload = message.to_json()?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let next_retry_at = match hold {
        Some(hold) => now + chrono::Duration::from_std(hold).unwrap_or_default(),
        None => now,
    };
    sqlx::query(
        r#"
        INSERT INTO outbox
            (id, tenant, aggregate_id, event_type, destination, payload,
             status, retry_count, max_retries, next_retry_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 'NEW', 0, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&message.tenant)
    .bind(message.submission_id.as_ref())
    .bind(format!("stage.{}", destination.as_str()))
    .bind(destination.as_str())
    .bind(payload)
    .bind(max_retries)
    .bind(next_retry_at)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

/// The staged-but-unpublished row for a submission headed to
/// `destination`. The bounded sync runner uses this to pick up the
/// message it is about to execute in process.
pub async fn find_new_for(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    destination: Stage,
) -> Result<Option<OutboxRow>, PipelineError> {
    let row = sqlx::query(
        "SELECT id, tenant, aggregate_id, destination, payload, retry_count, max_retries
         FROM outbox
         WHERE aggregate_id = ? AND destination = ? AND status = 'NEW'
         ORDER BY created_at
         LIMIT 1",
    )
    .bind(submission_id.as_ref())
    .bind(destination.as_str())
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| from_row(&r)).transpose()
}

/// Flips a row to `SENT` inside the caller's transaction. Used by the
/// sync runner after executing the destination stage in process: once the
/// stage's effects commit, the publisher must never deliver this row.
pub async fn mark_sent(tx: &mut SqliteTx, id: &str) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE outbox SET status = 'SENT', processed_at = ? WHERE id = ? AND status = 'NEW'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Exponential backoff with jitter: `base * 2^retry`, capped, plus up to
/// one extra base interval of noise.
pub fn backoff_delay(retry_count: i64, base: Duration, cap: Duration) -> Duration {
    let exp = retry_count.clamp(0, 20) as u32;
    let raw = base.saturating_mul(2u32.saturating_pow(exp));
    let capped = raw.min(cap);
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    (capped + Duration::from_millis(jitter_ms)).min(cap)
}

/// One publisher pass: claims up to `batch_size` eligible rows and pushes
/// them to the bus. Returns how many rows were published.
///
/// Claiming is a lease: the winner pushes `next_retry_at` forward before
/// sending, so a crashed publisher only delays the row instead of losing
/// it, and concurrent publisher instances cannot double-claim.
#[tracing::instrument(skip_all)]
pub async fn drain_once(
    pool: &SqlitePool,
    outbox_cfg: &OutboxSettings,
    pipeline_cfg: &PipelineSettings,
) -> Result<u64, PipelineError> {
    let now = Utc::now();
    let rows = sqlx::query(
        "SELECT id, tenant, aggregate_id, destination, payload, retry_count, max_retries
         FROM outbox
         WHERE status IN ('NEW', 'FAILED') AND next_retry_at <= ?
         ORDER BY created_at
         LIMIT ?",
    )
    .bind(now)
    .bind(outbox_cfg.batch_size)
    .fetch_all(pool)
    .await?;

    let mut published = 0;
    for row in &rows {
        let record = from_row(row)?;
        let lease_until = now + chrono::Duration::seconds(60);
        let claimed = sqlx::query(
            "UPDATE outbox SET next_retry_at = ?
             WHERE id = ? AND status IN ('NEW', 'FAILED') AND next_retry_at <= ?",
        )
        .bind(lease_until)
        .bind(&record.id)
        .bind(now)
        .execute(pool)
        .await?;
        if claimed.rows_affected() == 0 {
            continue; // another publisher instance took it
        }

        match publish(pool, pipeline_cfg, &record).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE outbox SET status = 'SENT', processed_at = ? WHERE id = ?",
                )
                .bind(Utc::now())
                .bind(&record.id)
                .execute(pool)
                .await?;
                published += 1;
            }
            Err(e) => {
                record_failure(pool, &record, outbox_cfg, &e).await?;
            }
        }
    }
    Ok(published)
}

async fn publish(
    pool: &SqlitePool,
    pipeline_cfg: &PipelineSettings,
    record: &OutboxRow,
) -> Result<(), PipelineError> {
    // the envelope's message id doubles as the FIFO deduplication id
    let message: PipelineMessage = serde_json::from_str(&record.payload)
        .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
    let queue = pipeline_cfg.resolve_queue(record.destination.queue());
    bus::send(
        pool,
        &queue,
        record.aggregate_id.as_str(),
        &message.message_id.to_string(),
        &record.payload,
        None,
    )
    .await
}

async fn record_failure(
    pool: &SqlitePool,
    record: &OutboxRow,
    cfg: &OutboxSettings,
    error: &PipelineError,
) -> Result<(), PipelineError> {
    let retry_count = record.retry_count + 1;
    if retry_count >= record.max_retries {
        tracing::error!(
            outbox_id = %record.id,
            aggregate_id = %record.aggregate_id,
            error = %error,
            "outbox row exhausted retries, parking as DEAD"
        );
        sqlx::query(
            "UPDATE outbox SET status = 'DEAD', retry_count = ?, last_error = ?, processed_at = ?
             WHERE id = ?",
        )
        .bind(retry_count)
        .bind(error.to_string())
        .bind(Utc::now())
        .bind(&record.id)
        .execute(pool)
        .await?;
        return Ok(());
    }

    let delay = backoff_delay(
        retry_count,
        Duration::from_millis(cfg.backoff_base_ms),
        Duration::from_millis(cfg.backoff_cap_ms),
    );
    let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    sqlx::query(
        "UPDATE outbox SET status = 'FAILED', retry_count = ?, last_error = ?, next_retry_at = ?
         WHERE id = ?",
    )
    .bind(retry_count)
    .bind(error.to_string())
    .bind(next_retry_at)
    .bind(&record.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Background publisher: drains the outbox on an interval for the life of
/// the process. Runs alongside the API like the other workers.
pub async fn init_publisher(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect_lazy_with(cfg.database.connection());
    run_publisher(pool, cfg.outbox, cfg.pipeline).await
}

pub async fn run_publisher(
    pool: SqlitePool,
    outbox_cfg: OutboxSettings,
    pipeline_cfg: PipelineSettings,
) -> Result<(), anyhow::Error> {
    loop {
        match drain_once(&pool, &outbox_cfg, &pipeline_cfg).await {
            Ok(0) => tokio::time::sleep(outbox_cfg.poll_interval()).await,
            Ok(_) => {} // keep draining while there is work
            Err(e) => {
                tracing::error!(error = %e, "outbox drain pass failed");
                tokio::time::sleep(outbox_cfg.poll_interval()).await;
            }
        }
    }
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxRow, PipelineError> {
    let destination: String = row.try_get("destination")?;
    Ok(OutboxRow {
        id: row.try_get("id")?,
        tenant: row.try_get("tenant")?,
        aggregate_id: row.try_get("aggregate_id")?,
        destination: destination
            .parse()
            .map_err(|e: String| PipelineError::transient(anyhow::anyhow!(e)))?,
        payload: row.try_get("payload")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
    })
}

/// Test/operator helper: `(destination, status)` pairs for a submission,
/// oldest first.
pub async fn rows_for(
    pool: &SqlitePool,
    submission_id: &SubmissionId,
) -> Result<Vec<(String, String)>, PipelineError> {
    let rows = sqlx::query(
        "SELECT destination, status FROM outbox WHERE aggregate_id = ? ORDER BY created_at, id",
    )
    .bind(submission_id.as_ref())
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| Ok((r.try_get("destination")?, r.try_get("status")?)))
        .collect()
}

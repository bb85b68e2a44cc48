use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;

use crate::domain::PipelineError;
use crate::domain::MAX_ENVELOPE_BYTES;

/// Queue holding messages that exceeded their redrive count. Never
/// auto-replayed; operators act on it.
pub const DLQ: &str = "dlq";

/// A message claimed from a queue. Holding one makes the claimer the
/// exclusive owner of its group until ack or nack.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub position: i64,
    pub id: String,
    pub queue: String,
    pub origin_queue: Option<String>,
    pub group_key: String,
    pub body: String,
    pub receive_count: i64,
}

/// Enqueues a message. `(queue, dedup_id)` deduplicates: a replayed send
/// with the same deduplication id is silently dropped, which is what
/// makes the publisher's at-least-once delivery safe.
#[tracing::instrument(skip(pool, body), fields(size = body.len()))]
pub async fn send(
    pool: &SqlitePool,
    queue: &str,
    group_key: &str,
    dedup_id: &str,
    body: &str,
    delay: Option<Duration>,
) -> Result<(), PipelineError> {
    if body.len() > MAX_ENVELOPE_BYTES {
        return Err(PipelineError::transient(anyhow::anyhow!(
            "message for queue {queue} exceeds {MAX_ENVELOPE_BYTES} bytes ({})",
            body.len()
        )));
    }
    let now = Utc::now();
    let visible_at = match delay {
        Some(d) => now + chrono::Duration::from_std(d).unwrap_or_default(),
        None => now,
    };
    sqlx::query(
        "INSERT OR IGNORE INTO queue_messages
            (id, queue, group_key, dedup_id, body, status, visible_at, enqueued_at)
         VALUES (?, ?, ?, ?, ?, 'ready', ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(queue)
    .bind(group_key)
    .bind(dedup_id)
    .bind(body)
    .bind(visible_at)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Claims the next deliverable message, or `None` when the queue has
/// nothing eligible.
///
/// FIFO per group: a message is only deliverable when its group has no
/// in-flight message and no earlier pending one — a nacked head blocks
/// its group until it redelivers or moves to the DLQ, exactly like a FIFO
/// bus with a group key. Across groups there is no ordering.
pub async fn receive(
    pool: &SqlitePool,
    queue: &str,
    visibility_timeout: Duration,
) -> Result<Option<ClaimedMessage>, PipelineError> {
    let now = Utc::now();
    release_expired_claims(pool, queue, now).await?;

    let candidate = sqlx::query(
        r#"
        SELECT position, id, origin_queue, group_key, body, receive_count
        FROM queue_messages m
        WHERE m.queue = ? AND m.status = 'ready' AND m.visible_at <= ?
          AND NOT EXISTS (
              SELECT 1 FROM queue_messages f
              WHERE f.queue = m.queue
                AND f.group_key = m.group_key
                AND (f.status = 'inflight'
                     OR (f.status = 'ready' AND f.position < m.position))
          )
        ORDER BY m.position
        LIMIT 1
        "#,
    )
    .bind(queue)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some(row) = candidate else {
        return Ok(None);
    };
    let position: i64 = row.try_get("position")?;

    // the guarded flip arbitrates concurrent receivers; a loser just
    // polls again
    let claimed_until =
        now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
    let claimed = sqlx::query(
        "UPDATE queue_messages
         SET status = 'inflight', receive_count = receive_count + 1, claimed_until = ?
         WHERE position = ? AND status = 'ready'",
    )
    .bind(claimed_until)
    .bind(position)
    .execute(pool)
    .await?;
    if claimed.rows_affected() == 0 {
        return Ok(None);
    }

    Ok(Some(ClaimedMessage {
        position,
        id: row.try_get("id")?,
        queue: queue.to_owned(),
        origin_queue: row.try_get("origin_queue")?,
        group_key: row.try_get("group_key")?,
        body: row.try_get("body")?,
        receive_count: row.try_get::<i64, _>("receive_count")? + 1,
    }))
}

/// Deletes the message: processing committed, the group unblocks.
pub async fn ack(pool: &SqlitePool, message: &ClaimedMessage) -> Result<(), PipelineError> {
    sqlx::query("DELETE FROM queue_messages WHERE position = ?")
        .bind(message.position)
        .execute(pool)
        .await?;
    Ok(())
}

/// Returns the message for redelivery after `delay`, or moves it to the
/// DLQ once the redrive count is exhausted. Returns `true` when the
/// message went to the DLQ.
pub async fn nack(
    pool: &SqlitePool,
    message: &ClaimedMessage,
    max_receive_count: i64,
    delay: Duration,
) -> Result<bool, PipelineError> {
    if message.receive_count >= max_receive_count {
        move_to_dlq(pool, message).await?;
        return Ok(true);
    }
    let visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    sqlx::query(
        "UPDATE queue_messages
         SET status = 'ready', claimed_until = NULL, visible_at = ?
         WHERE position = ?",
    )
    .bind(visible_at)
    .bind(message.position)
    .execute(pool)
    .await?;
    Ok(false)
}

/// Immediate DLQ move, bypassing the redrive budget (poison messages).
pub async fn move_to_dlq(
    pool: &SqlitePool,
    message: &ClaimedMessage,
) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE queue_messages
         SET queue = ?, origin_queue = ?, status = 'ready',
             claimed_until = NULL, visible_at = ?
         WHERE position = ?",
    )
    .bind(DLQ)
    .bind(&message.queue)
    .bind(Utc::now())
    .bind(message.position)
    .execute(pool)
    .await?;
    Ok(())
}

/// Messages whose claim expired go back to `ready`; the worker holding
/// them died or overran its visibility timeout.
async fn release_expired_claims(
    pool: &SqlitePool,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE queue_messages
         SET status = 'ready', claimed_until = NULL
         WHERE queue = ? AND status = 'inflight' AND claimed_until <= ?",
    )
    .bind(queue)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Number of messages sitting in a queue (any status).
pub async fn depth(pool: &SqlitePool, queue: &str) -> Result<i64, PipelineError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE queue = ?")
        .bind(queue)
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("n")?)
}

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use sqlx::SqlitePool;

use crate::domain::PipelineError;
use crate::domain::Stage;
use crate::domain::SubmissionId;
use crate::tracker::SqliteTx;

/// Event kinds recorded on the per-submission timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    StageStart,
    StageOk,
    StageFail,
    /// Side-path branch reached its own terminal state.
    BranchComplete,
    /// Main path reached a terminal status.
    PipelineComplete,
    Poison,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StageStart => "STAGE_START",
            EventType::StageOk => "STAGE_OK",
            EventType::StageFail => "STAGE_FAIL",
            EventType::BranchComplete => "BRANCH_COMPLETE",
            EventType::PipelineComplete => "PIPELINE_COMPLETE",
            EventType::Poison => "POISON",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub sequence_no: i64,
    pub stage: String,
    pub event_type: String,
    pub retryable: Option<bool>,
    pub duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewEvent<'a> {
    pub stage: Stage,
    pub event_type: EventType,
    pub retryable: Option<bool>,
    pub duration_ms: Option<i64>,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

impl<'a> NewEvent<'a> {
    pub fn start(stage: Stage) -> Self {
        Self {
            stage,
            event_type: EventType::StageStart,
            retryable: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn ok(stage: Stage, duration_ms: i64) -> Self {
        Self {
            stage,
            event_type: EventType::StageOk,
            retryable: None,
            duration_ms: Some(duration_ms),
            error_code: None,
            error_message: None,
        }
    }

    pub fn fail(stage: Stage, retryable: bool, code: &'a str, message: &'a str) -> Self {
        Self {
            stage,
            event_type: EventType::StageFail,
            retryable: Some(retryable),
            duration_ms: None,
            error_code: Some(code),
            error_message: Some(message),
        }
    }
}

/// Appends an event with the next `sequence_no` for the submission.
///
/// Allocation and insert are one statement: the side path writes events
/// for the same submission concurrently with the main path, and a
/// read-then-insert would race. A single INSERT..SELECT serializes under
/// the database's write lock; the unique constraint backstops it.
pub async fn record(
    tx: &mut SqliteTx,
    submission_id: &SubmissionId,
    event: NewEvent<'_>,
) -> Result<i64, PipelineError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO event_tracker
            (submission_id, sequence_no, stage, event_type, retryable,
             duration_ms, error_code, error_message, month, created_at)
        SELECT ?, COALESCE(MAX(sequence_no), 0) + 1, ?, ?, ?, ?, ?, ?, ?, ?
        FROM event_tracker WHERE submission_id = ?
        "#,
    )
    .bind(submission_id.as_ref())
    .bind(event.stage.as_str())
    .bind(event.event_type.as_str())
    .bind(event.retryable)
    .bind(event.duration_ms)
    .bind(event.error_code)
    .bind(event.error_message)
    .bind(now.format("%Y%m").to_string())
    .bind(now)
    .bind(submission_id.as_ref())
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        "SELECT sequence_no FROM event_tracker WHERE id = last_insert_rowid()",
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.try_get("sequence_no")?)
}

/// Timeline for one submission, in `sequence_no` order.
pub async fn timeline(
    pool: &SqlitePool,
    submission_id: &SubmissionId,
) -> Result<Vec<StageEvent>, PipelineError> {
    let rows = sqlx::query(
        "SELECT sequence_no, stage, event_type, retryable, duration_ms,
                error_code, error_message, created_at
         FROM event_tracker WHERE submission_id = ? ORDER BY sequence_no",
    )
    .bind(submission_id.as_ref())
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(StageEvent {
                sequence_no: row.try_get("sequence_no")?,
                stage: row.try_get("stage")?,
                event_type: row.try_get("event_type")?,
                retryable: row.try_get("retryable")?,
                duration_ms: row.try_get("duration_ms")?,
                error_code: row.try_get("error_code")?,
                error_message: row.try_get("error_message")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[tokio::test]
    async fn sequence_numbers_are_strictly_increasing() {
        let (_dir, pool) = test_pool().await;
        let id = SubmissionId::generate(Utc::now());

        for stage in [Stage::Parse, Stage::Validate, Stage::Enrich] {
            let mut tx = pool.begin().await.unwrap();
            record(&mut tx, &id, NewEvent::start(stage)).await.unwrap();
            record(&mut tx, &id, NewEvent::ok(stage, 5)).await.unwrap();
            tx.commit().await.unwrap();
        }

        let events = timeline(&pool, &id).await.unwrap();
        assert_eq!(events.len(), 6);
        for pair in events.windows(2) {
            assert!(pair[0].sequence_no < pair[1].sequence_no);
        }
    }

    #[tokio::test]
    async fn sequences_are_scoped_per_submission() {
        let (_dir, pool) = test_pool().await;
        let a = SubmissionId::generate(Utc::now());
        let b = SubmissionId::generate(Utc::now());

        let mut tx = pool.begin().await.unwrap();
        let first = record(&mut tx, &a, NewEvent::start(Stage::Parse)).await.unwrap();
        let other = record(&mut tx, &b, NewEvent::start(Stage::Parse)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn failures_record_retryability() {
        let (_dir, pool) = test_pool().await;
        let id = SubmissionId::generate(Utc::now());

        let mut tx = pool.begin().await.unwrap();
        record(
            &mut tx,
            &id,
            NewEvent::fail(Stage::PayerCall, true, "PAYER_5XX", "upstream unavailable"),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let events = timeline(&pool, &id).await.unwrap();
        assert_eq!(events[0].event_type, "STAGE_FAIL");
        assert_eq!(events[0].retryable, Some(true));
        assert_eq!(events[0].error_code.as_deref(), Some("PAYER_5XX"));
    }
}

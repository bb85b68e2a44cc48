use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use crate::audit;
use crate::bus;
use crate::bus::ClaimedMessage;
use crate::configuration::Settings;
use crate::deps::Deps;
use crate::domain::AdvanceInfo;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::StageResult;
use crate::domain::SubmissionId;
use crate::domain::SubmissionStatus;
use crate::domain::ValidationIssue;
use crate::events;
use crate::events::EventType;
use crate::events::NewEvent;
use crate::idempotency;
use crate::object_store;
use crate::outbox;
use crate::stages;
use crate::tracker;
use crate::tracker::ArtifactSlot;

/// How the bounded sync runner threads itself through a stage execution:
/// the outbox row being executed in process is flipped to SENT inside the
/// effect transaction, and rows staged for further sync-eligible stages
/// are held back from the publisher for the rest of the sync window.
#[derive(Debug, Clone, Copy)]
pub struct SyncConsume<'a> {
    pub row_id: &'a str,
    pub hold_remaining: Duration,
}

/// Interpreted disposition of one stage execution. Every variant except
/// `Retry` means the message's effects are committed and it can be acked.
#[derive(Debug)]
pub enum Applied {
    Advanced { destinations: Vec<Stage> },
    Terminal { status: SubmissionStatus },
    /// Side-path branch finished; the main path is untouched.
    BranchDone,
    /// Non-retryable failure, submission terminalized.
    Failed { issues: Vec<ValidationIssue> },
    /// Parked until the payer callback re-injects at build-response.
    Awaiting,
    /// Transient failure recorded; the caller nacks for redelivery.
    Retry { code: String, message: String },
}

/// Spawns one consumer loop per stage and runs them for the life of the
/// process.
pub async fn init_stage_workers(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect_lazy_with(cfg.database.connection());
    let deps = Arc::new(Deps::new(cfg, pool));
    run_stage_workers(deps).await
}

pub async fn run_stage_workers(deps: Arc<Deps>) -> Result<(), anyhow::Error> {
    let mut handles = Vec::new();
    for stage in Stage::all() {
        let deps = deps.clone();
        handles.push(tokio::spawn(worker_loop(deps, stage)));
    }
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

async fn worker_loop(deps: Arc<Deps>, stage: Stage) {
    let queue = deps.settings.pipeline.resolve_queue(stage.queue());
    let poll = deps.settings.pipeline.poll_interval();
    let visibility = deps.settings.pipeline.visibility_timeout();
    loop {
        match bus::receive(&deps.pool, &queue, visibility).await {
            Ok(Some(claimed)) => {
                if let Err(e) = process_claimed(&deps, stage, claimed).await {
                    tracing::error!(stage = %stage, error = %e, "message processing failed");
                    tokio::time::sleep(poll).await;
                }
            }
            Ok(None) => tokio::time::sleep(poll).await,
            Err(e) => {
                tracing::error!(stage = %stage, error = %e, "queue receive failed");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

/// Runs one claimed bus message through its stage and disposes of it:
/// ack on any committed outcome, nack for redelivery on transient
/// failure, DLQ once the redrive budget is gone.
#[tracing::instrument(skip(deps, claimed), fields(message_id = %claimed.id, group = %claimed.group_key))]
pub async fn process_claimed(
    deps: &Deps,
    stage: Stage,
    claimed: ClaimedMessage,
) -> Result<(), PipelineError> {
    let msg = match serde_json::from_str::<PipelineMessage>(&claimed.body) {
        Ok(msg) if msg.stage == stage => msg,
        Ok(msg) => {
            tracing::error!(
                expected = %stage,
                carried = %msg.stage,
                "envelope routed to the wrong queue"
            );
            return quarantine(deps, stage, &claimed).await;
        }
        Err(e) => {
            tracing::error!(error = %e, "undeserializable envelope");
            return quarantine(deps, stage, &claimed).await;
        }
    };

    let timeout = deps.settings.pipeline.stage_timeout(stage.as_str());
    match execute_stage(deps, &msg, timeout, None).await {
        Ok(Applied::Retry { code, message }) => {
            let delay = redelivery_delay(deps, claimed.receive_count);
            let moved = bus::nack(
                &deps.pool,
                &claimed,
                deps.settings.pipeline.max_receive_count,
                delay,
            )
            .await?;
            if moved {
                // poison-level isolation: tracker parks in {stage}_ERROR
                // until an operator redrives the DLQ
                tracing::error!(
                    submission_id = %msg.submission_id,
                    stage = %stage,
                    code = %code,
                    "redrive budget exhausted, message moved to DLQ"
                );
                let mut tx = deps.pool.begin().await?;
                tracker::update_error(
                    &mut tx,
                    &msg.submission_id,
                    &code,
                    &message,
                    Some(stage.error_status()),
                )
                .await?;
                tx.commit().await?;
            }
            Ok(())
        }
        Ok(_) => bus::ack(&deps.pool, &claimed).await,
        Err(e) => {
            // the bookkeeping itself failed; leave the message for
            // redelivery
            let delay = redelivery_delay(deps, claimed.receive_count);
            bus::nack(
                &deps.pool,
                &claimed,
                deps.settings.pipeline.max_receive_count,
                delay,
            )
            .await?;
            Err(e)
        }
    }
}

fn redelivery_delay(deps: &Deps, receive_count: i64) -> Duration {
    outbox::backoff_delay(
        receive_count,
        deps.settings.pipeline.poll_interval(),
        deps.settings.pipeline.visibility_timeout(),
    )
}

/// Poison handling: the message cycles through the redrive budget and
/// lands on the DLQ; if the group key still names a submission, its
/// timeline gets a POISON event and the tracker parks in the stage's
/// error state. `last_stage` never advances.
async fn quarantine(
    deps: &Deps,
    stage: Stage,
    claimed: &ClaimedMessage,
) -> Result<(), PipelineError> {
    let delay = redelivery_delay(deps, claimed.receive_count);
    let moved = bus::nack(
        &deps.pool,
        claimed,
        deps.settings.pipeline.max_receive_count,
        delay,
    )
    .await?;
    if !moved {
        return Ok(());
    }

    if let Ok(submission_id) = SubmissionId::parse(&claimed.group_key) {
        let mut tx = deps.pool.begin().await?;
        events::record(
            &mut tx,
            &submission_id,
            NewEvent {
                stage,
                event_type: EventType::Poison,
                retryable: Some(false),
                duration_ms: None,
                error_code: Some("POISON_MESSAGE"),
                error_message: Some("undeserializable envelope"),
            },
        )
        .await?;
        tracker::update_error(
            &mut tx,
            &submission_id,
            "POISON_MESSAGE",
            "undeserializable envelope moved to DLQ",
            Some(stage.error_status()),
        )
        .await?;
        tx.commit().await?;
    }
    Ok(())
}

/// Executes one stage invocation: start event, artifact load, handler
/// under its deadline, then result application in a single transaction.
///
/// `sync` is the bounded sync runner's hook: the row being executed in
/// process gets flipped to SENT inside the same transaction as the
/// stage's effects, so the publisher can never double-deliver it.
pub async fn execute_stage(
    deps: &Deps,
    msg: &PipelineMessage,
    timeout: Duration,
    sync: Option<SyncConsume<'_>>,
) -> Result<Applied, PipelineError> {
    let stage = msg.stage;
    let started = std::time::Instant::now();

    // the start event commits before the effect transaction so failed
    // attempts keep their audit trail
    let mut tx = deps.pool.begin().await?;
    events::record(&mut tx, &msg.submission_id, NewEvent::start(stage)).await?;
    if !deps.pipeline.is_side_path(stage) {
        tracker::mark_stage_started(&mut tx, &msg.submission_id, stage.in_progress_status())
            .await?;
    }
    tx.commit().await?;

    let input = match object_store::fetch(deps.store.as_ref(), &msg.payload_ref()).await {
        Ok(input) => input,
        Err(e) if e.is_retryable() => {
            record_retryable_failure(deps, msg, &e.code(), &e.to_string()).await?;
            return Ok(Applied::Retry {
                code: e.code(),
                message: e.to_string(),
            });
        }
        Err(e) => {
            let issues = vec![ValidationIssue::error(&e.code(), "$", &e.to_string())];
            record_terminal_failure(deps, msg, &issues, sync).await?;
            return Ok(Applied::Failed { issues });
        }
    };

    let result = match tokio::time::timeout(timeout, stages::run(deps, msg, &input)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_retryable() => {
            record_retryable_failure(deps, msg, &e.code(), &e.to_string()).await?;
            return Ok(Applied::Retry {
                code: e.code(),
                message: e.to_string(),
            });
        }
        Ok(Err(e)) => {
            let issues = vec![ValidationIssue::error(&e.code(), "$", &e.to_string())];
            record_terminal_failure(deps, msg, &issues, sync).await?;
            return Ok(Applied::Failed { issues });
        }
        Err(_) => StageResult::TransientFailure {
            code: "STAGE_TIMEOUT".to_owned(),
            message: format!("stage {stage} exceeded its {timeout:?} deadline"),
        },
    };

    let duration_ms = started.elapsed().as_millis() as i64;
    match result {
        StageResult::TransientFailure { code, message } => {
            record_retryable_failure(deps, msg, &code, &message).await?;
            Ok(Applied::Retry { code, message })
        }
        StageResult::ValidationFailure { issues } => {
            record_terminal_failure(deps, msg, &issues, sync).await?;
            Ok(Applied::Failed { issues })
        }
        StageResult::Advance(info) => {
            // rewrap so the branch predicates can see the flags
            let result = StageResult::Advance(info);
            let destinations = deps.pipeline.destinations(stage, &result);
            let StageResult::Advance(info) = result else {
                unreachable!()
            };
            apply_advance(
                deps,
                msg,
                info,
                destinations,
                None,
                duration_ms,
                sync,
            )
            .await
        }
        StageResult::FanOut { legs, info } => {
            for leg in &legs {
                if !deps.pipeline.edge_exists(stage, leg.stage) {
                    return Err(PipelineError::transient(anyhow::anyhow!(
                        "fan-out leg {} -> {} is not a declared edge",
                        stage,
                        leg.stage
                    )));
                }
            }
            let destinations = legs.iter().map(|l| l.stage).collect();
            let legs = Some(legs);
            apply_advance(
                deps,
                msg,
                info,
                destinations,
                legs,
                duration_ms,
                sync,
            )
            .await
        }
        StageResult::TerminalSuccess {
            artifact,
            with_errors,
        } => apply_terminal(deps, msg, artifact, with_errors, duration_ms, sync).await,
        StageResult::AwaitCallback {
            external_reference_id,
            artifact,
        } => {
            let mut tx = deps.pool.begin().await?;
            if let Some(sync) = sync {
                outbox::mark_sent(&mut tx, sync.row_id).await?;
            }
            if let Some(artifact) = &artifact {
                if let Some(slot) = ArtifactSlot::for_stage(stage) {
                    tracker::set_artifact(&mut tx, &msg.submission_id, slot, artifact).await?;
                }
            }
            tracker::update_external_reference(&mut tx, &msg.submission_id, &external_reference_id)
                .await?;
            tracker::mark_stage_done(
                &mut tx,
                &msg.submission_id,
                stage,
                Some(SubmissionStatus::AwaitingCallback),
                Some(Stage::BuildResponse),
            )
            .await?;
            events::record(&mut tx, &msg.submission_id, NewEvent::ok(stage, duration_ms)).await?;
            tx.commit().await?;
            Ok(Applied::Awaiting)
        }
    }
}

/// Applies a successful advance/fan-out: artifact slots, successor
/// envelopes staged through the outbox, stage bookkeeping — all in one
/// transaction, so the tracker update and the outbox rows are atomic.
#[allow(clippy::too_many_arguments)]
async fn apply_advance(
    deps: &Deps,
    msg: &PipelineMessage,
    info: AdvanceInfo,
    destinations: Vec<Stage>,
    legs: Option<Vec<crate::domain::FanOutLeg>>,
    duration_ms: i64,
    sync: Option<SyncConsume<'_>>,
) -> Result<Applied, PipelineError> {
    let stage = msg.stage;
    if destinations.is_empty() {
        return Err(PipelineError::transient(anyhow::anyhow!(
            "stage {stage} advanced but has no destinations"
        )));
    }

    let now = Utc::now();
    let carried_artifact = info
        .artifact
        .clone()
        .unwrap_or_else(|| msg.payload_ref());
    let has_attachments = info.has_attachments || msg.has_attachments;
    let attachment_count = if info.attachment_count > 0 {
        info.attachment_count
    } else {
        msg.attachment_count
    };

    let mut tx = deps.pool.begin().await?;
    if let Some(sync) = sync {
        outbox::mark_sent(&mut tx, sync.row_id).await?;
    }
    if let Some(artifact) = &info.artifact {
        if let Some(slot) = ArtifactSlot::for_stage(stage) {
            tracker::set_artifact(&mut tx, &msg.submission_id, slot, artifact).await?;
        }
    }
    if let Some(payer_id) = &info.payer_id {
        tracker::update_payer_id(&mut tx, &msg.submission_id, payer_id).await?;
    }
    if let Some(external_id) = &info.external_reference_id {
        tracker::update_external_reference(&mut tx, &msg.submission_id, external_id).await?;
    }

    for dest in &destinations {
        let leg_artifact = legs
            .as_ref()
            .and_then(|legs| legs.iter().find(|l| l.stage == *dest))
            .map(|l| l.artifact.clone())
            .unwrap_or_else(|| carried_artifact.clone());
        let mut successor = msg.successor(*dest, &leg_artifact, now);
        successor.has_attachments = has_attachments;
        successor.attachment_count = attachment_count;
        if let Some(path) = &info.parsed_data_path {
            successor.parsed_data_s3_path = Some(path.clone());
        }
        if let Some(external_id) = &info.external_reference_id {
            successor.external_reference_id = Some(external_id.clone());
        }
        if let Some(status) = &info.api_response_status {
            successor.api_response_status = Some(status.clone());
        }
        if let Some((code, message)) = &info.error {
            successor.error_code = Some(code.clone());
            successor.error_message = Some(message.clone());
        }
        // rows the sync runner will execute itself stay out of the
        // publisher's reach for the rest of the window
        let hold = sync
            .filter(|_| crate::sync_path::is_sync_stage(*dest))
            .map(|s| s.hold_remaining);
        outbox::write(
            &mut tx,
            *dest,
            &successor,
            deps.settings.outbox.max_retries,
            hold,
        )
        .await?;
    }

    let next_main = destinations
        .iter()
        .copied()
        .find(|d| !deps.pipeline.is_side_path(*d));
    tracker::mark_stage_done(
        &mut tx,
        &msg.submission_id,
        stage,
        stage.done_status(),
        next_main,
    )
    .await?;
    events::record(&mut tx, &msg.submission_id, NewEvent::ok(stage, duration_ms)).await?;
    tx.commit().await?;

    Ok(Applied::Advanced { destinations })
}

async fn apply_terminal(
    deps: &Deps,
    msg: &PipelineMessage,
    artifact: Option<ArtifactRef>,
    with_errors: bool,
    duration_ms: i64,
    sync: Option<SyncConsume<'_>>,
) -> Result<Applied, PipelineError> {
    let stage = msg.stage;

    if deps.pipeline.is_side_path(stage) {
        let mut tx = deps.pool.begin().await?;
        if let Some(sync) = sync {
            outbox::mark_sent(&mut tx, sync.row_id).await?;
        }
        events::record(&mut tx, &msg.submission_id, NewEvent::ok(stage, duration_ms)).await?;
        events::record(
            &mut tx,
            &msg.submission_id,
            NewEvent {
                stage,
                event_type: EventType::BranchComplete,
                retryable: None,
                duration_ms: None,
                error_code: None,
                error_message: None,
            },
        )
        .await?;
        tx.commit().await?;
        return Ok(Applied::BranchDone);
    }

    let status = if with_errors {
        SubmissionStatus::CompletedWithErrors
    } else {
        SubmissionStatus::Completed
    };
    let final_ref = artifact.unwrap_or_else(|| msg.payload_ref());
    let row = tracker::get(&deps.pool, &msg.submission_id).await?;

    let mut tx = deps.pool.begin().await?;
    if let Some(sync) = sync {
        outbox::mark_sent(&mut tx, sync.row_id).await?;
    }
    tracker::update_final_status(&mut tx, &msg.submission_id, status, stage, Some(&final_ref))
        .await?;
    events::record(&mut tx, &msg.submission_id, NewEvent::ok(stage, duration_ms)).await?;
    events::record(
        &mut tx,
        &msg.submission_id,
        NewEvent {
            stage,
            event_type: EventType::PipelineComplete,
            retryable: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
        },
    )
    .await?;
    if let Some(row) = &row {
        if let Some(key) = &row.idempotency_key {
            idempotency::record_response(&mut tx, &row.tenant, key, &final_ref).await?;
        }
    }
    audit::record(
        &mut tx,
        Some(&msg.submission_id),
        &msg.tenant,
        "pipeline-completed",
        Some(status.as_str()),
    )
    .await?;
    tx.commit().await?;

    Ok(Applied::Terminal { status })
}

async fn record_retryable_failure(
    deps: &Deps,
    msg: &PipelineMessage,
    code: &str,
    message: &str,
) -> Result<(), PipelineError> {
    let mut tx = deps.pool.begin().await?;
    events::record(
        &mut tx,
        &msg.submission_id,
        NewEvent::fail(msg.stage, true, code, message),
    )
    .await?;
    tracker::update_error(&mut tx, &msg.submission_id, code, message, None).await?;
    tx.commit().await?;
    Ok(())
}

async fn record_terminal_failure(
    deps: &Deps,
    msg: &PipelineMessage,
    issues: &[ValidationIssue],
    sync: Option<SyncConsume<'_>>,
) -> Result<(), PipelineError> {
    let stage = msg.stage;
    let code = issues
        .first()
        .map(|i| i.code.clone())
        .unwrap_or_else(|| "VALIDATION_FAILED".to_owned());
    let message = issues
        .iter()
        .map(|i| format!("{}: {}", i.location, i.message))
        .collect::<Vec<_>>()
        .join("; ");

    let mut tx = deps.pool.begin().await?;
    if let Some(sync) = sync {
        outbox::mark_sent(&mut tx, sync.row_id).await?;
    }
    events::record(
        &mut tx,
        &msg.submission_id,
        NewEvent::fail(stage, false, &code, &message),
    )
    .await?;
    tracker::update_error(
        &mut tx,
        &msg.submission_id,
        &code,
        &message,
        Some(stage.error_status()),
    )
    .await?;
    tracker::update_final_status(&mut tx, &msg.submission_id, SubmissionStatus::Failed, stage, None)
        .await?;
    audit::record(
        &mut tx,
        Some(&msg.submission_id),
        &msg.tenant,
        "submission-failed",
        Some(&code),
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

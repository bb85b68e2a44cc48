use std::time::Instant;

use crate::deps::Deps;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::SubmissionId;
use crate::domain::ValidationIssue;
use crate::outbox;
use crate::worker;
use crate::worker::Applied;

/// Stages the bounded sync runner executes in process. Everything after
/// them always runs through the asynchronous arm.
const SYNC_STAGES: [Stage; 2] = [Stage::Parse, Stage::Validate];

/// Whether the sync runner would execute this stage itself. Outbox rows
/// headed to these stages are held back from the publisher while a sync
/// window is open.
pub fn is_sync_stage(stage: Stage) -> bool {
    SYNC_STAGES.contains(&stage)
}

#[derive(Debug)]
pub enum SyncOutcome {
    /// Parse and validate both passed within the window.
    Approved,
    /// Validation failed; the submission is terminalized.
    Invalid(Vec<ValidationIssue>),
    /// The window elapsed (or a stage failed transiently) before a
    /// definitive outcome; the async arm continues from the staged rows.
    Pended,
}

/// Runs the sync-eligible stages in process against the outbox rows the
/// pipeline has already staged. Each execution consumes its row (flipped
/// to SENT inside the stage's own transaction), so nothing here can be
/// double-delivered by the publisher — and anything not consumed before
/// the deadline drains asynchronously as if the sync path never ran.
#[tracing::instrument(skip(deps))]
pub async fn run_bounded(
    deps: &Deps,
    submission_id: &SubmissionId,
) -> Result<SyncOutcome, PipelineError> {
    let deadline = Instant::now() + deps.settings.sync.deadline();

    for stage in SYNC_STAGES {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(SyncOutcome::Pended);
        }

        let mut tx = deps.pool.begin().await?;
        let row = outbox::find_new_for(&mut tx, submission_id, stage).await?;
        tx.commit().await?;
        let Some(row) = row else {
            // a concurrent path already consumed it; fall back to async
            tracing::warn!(%submission_id, %stage, "no staged row for sync execution");
            return Ok(SyncOutcome::Pended);
        };

        let msg: PipelineMessage = serde_json::from_str(&row.payload)
            .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
        let stage_deadline = remaining.min(deps.settings.sync.stage_deadline());
        let sync = worker::SyncConsume {
            row_id: &row.id,
            hold_remaining: remaining,
        };

        match worker::execute_stage(deps, &msg, stage_deadline, Some(sync)).await? {
            Applied::Advanced { .. } => {}
            Applied::Failed { issues } => return Ok(SyncOutcome::Invalid(issues)),
            Applied::Retry { code, .. } => {
                // the row is still NEW; the async arm will retry it
                tracing::info!(%submission_id, %stage, code = %code, "sync stage pended");
                return Ok(SyncOutcome::Pended);
            }
            Applied::Terminal { .. } | Applied::BranchDone | Applied::Awaiting => {
                // not reachable for parse/validate; be safe and pend
                return Ok(SyncOutcome::Pended);
            }
        }
    }

    Ok(SyncOutcome::Approved)
}

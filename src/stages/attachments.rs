use chrono::Utc;

use super::parse_document;
use crate::deps::Deps;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;
use crate::object_store::keys;

/// Side path: persists every attachment from the parsed bundle under its
/// own object key and tracks it. Terminal on this branch — the main
/// path's completion never waits for it.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let parsed = parse_document(input)?;
    let received = super::received_at(msg);

    for attachment in &parsed.attachments {
        let key = keys::attachment(&msg.submission_id, received, &attachment.attachment_id);
        let bytes = attachment.data.as_bytes();
        deps.store.put(&msg.payload_bucket, &key, bytes).await?;

        // retries overwrite deterministically, so upsert is safe
        sqlx::query(
            "INSERT OR REPLACE INTO attachment_tracker
                (submission_id, attachment_id, content_type, size_bytes,
                 bucket, object_key, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'STORED', ?)",
        )
        .bind(msg.submission_id.as_ref())
        .bind(&attachment.attachment_id)
        .bind(&attachment.content_type)
        .bind(bytes.len() as i64)
        .bind(&msg.payload_bucket)
        .bind(&key)
        .bind(Utc::now())
        .execute(&deps.pool)
        .await?;
    }

    tracing::info!(
        submission_id = %msg.submission_id,
        count = parsed.attachments.len(),
        "attachments stored"
    );
    Ok(StageResult::TerminalSuccess {
        artifact: None,
        with_errors: false,
    })
}

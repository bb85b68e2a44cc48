use sqlx::Row;

use super::parse_document;
use crate::deps::Deps;
use crate::domain::AdvanceInfo;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;
use crate::domain::ValidationIssue;
use crate::object_store::keys;

/// Converts the enriched claim into the payer-specific canonical format
/// described by `payer_configuration`, and writes `canonical.json`. The
/// canonical document carries the payer endpoint path so the payer-call
/// stage needs no second lookup.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let parsed = parse_document(input)?;
    let payer_id = parsed.claim.payer_id.clone().unwrap_or_default();

    let Some((format_version, endpoint_path)) = lookup_payer(deps, &payer_id).await? else {
        return Ok(StageResult::ValidationFailure {
            issues: vec![ValidationIssue::error(
                "UNSUPPORTED_PAYER",
                "claim.payerId",
                &format!("no enabled configuration for payer {payer_id}"),
            )],
        });
    };

    let canonical = serde_json::json!({
        "formatVersion": format_version,
        "endpointPath": endpoint_path,
        "submissionId": parsed.submission_id,
        "tenant": parsed.tenant,
        "claim": parsed.claim,
        "provider": parsed.provider,
    });
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
    let received = super::received_at(msg);
    let key = keys::canonical(&msg.submission_id, received);
    deps.store.put(&msg.payload_bucket, &key, &bytes).await?;

    Ok(StageResult::Advance(AdvanceInfo {
        artifact: Some(ArtifactRef::new(msg.payload_bucket.clone(), key)),
        payer_id: Some(payer_id),
        ..AdvanceInfo::default()
    }))
}

async fn lookup_payer(
    deps: &Deps,
    payer_id: &str,
) -> Result<Option<(String, String)>, PipelineError> {
    let row = sqlx::query(
        "SELECT format_version, endpoint_path FROM payer_configuration
         WHERE payer_id = ? AND enabled = 1",
    )
    .bind(payer_id)
    .fetch_optional(&deps.pool)
    .await?;
    row.map(|r| Ok((r.try_get("format_version")?, r.try_get("endpoint_path")?)))
        .transpose()
}

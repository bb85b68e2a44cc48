use crate::deps::Deps;
use crate::domain::AdvanceInfo;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;
use crate::object_store::fetch;
use crate::object_store::keys;
use crate::tracker;

/// Shapes the standard response bundle from the payer reply and the
/// parsed claim, and writes `final.json`. Business rejections from the
/// payer become error responses here rather than failures.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let payer_reply: serde_json::Value = serde_json::from_slice(input)?;

    // the parsed claim gives the response its request context
    let row = tracker::get(&deps.pool, &msg.submission_id)
        .await?
        .ok_or_else(|| {
            PipelineError::transient(anyhow::anyhow!(
                "no tracker row for {}",
                msg.submission_id
            ))
        })?;
    let claim_summary = match &row.parsed_ref {
        Some(parsed_ref) => {
            let bytes = fetch(deps.store.as_ref(), parsed_ref).await?;
            let doc = super::parse_document(&bytes)?;
            serde_json::json!({
                "claimId": doc.claim.claim_id,
                "patientReference": doc.claim.patient_reference,
                "providerNpi": doc.claim.provider_npi,
                "payerId": doc.claim.payer_id,
            })
        }
        None => serde_json::Value::Null,
    };

    let disposition = msg
        .api_response_status
        .clone()
        .unwrap_or_else(|| "error".to_owned());
    let final_bundle = serde_json::json!({
        "resourceType": "ClaimResponseBundle",
        "submissionId": msg.submission_id,
        "disposition": disposition,
        "externalReferenceId": msg.external_reference_id,
        "claim": claim_summary,
        "payerReply": payer_reply,
        "errors": msg.error_code.as_ref().map(|code| {
            vec![serde_json::json!({
                "code": code,
                "message": msg.error_message.clone().unwrap_or_default(),
            })]
        }),
    });

    let bytes = serde_json::to_vec(&final_bundle)
        .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
    let received = super::received_at(msg);
    let key = keys::final_response(&msg.submission_id, received);
    deps.store.put(&msg.payload_bucket, &key, &bytes).await?;

    Ok(StageResult::Advance(AdvanceInfo {
        artifact: Some(ArtifactRef::new(msg.payload_bucket.clone(), key)),
        api_response_status: Some(disposition),
        error: msg
            .error_code
            .clone()
            .map(|code| (code, msg.error_message.clone().unwrap_or_default())),
        ..AdvanceInfo::default()
    }))
}

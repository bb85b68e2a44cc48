use serde::Deserialize;

use crate::deps::Deps;
use crate::domain::AdvanceInfo;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;
use crate::object_store::keys;
use crate::payer_client::PayerReply;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalEnvelope {
    endpoint_path: String,
}

/// Submits the canonical payload to the payer and classifies the reply.
/// Retryable payer failures surface as `TransientFailure` so the bus
/// redelivers within the stage's retry budget; a 4xx travels onward as a
/// business outcome for `build-response` to shape.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let canonical: serde_json::Value = serde_json::from_slice(input)?;
    let envelope: CanonicalEnvelope = serde_json::from_value(canonical.clone())?;

    let reply = match deps.payer.submit(&envelope.endpoint_path, &canonical).await {
        Ok(reply) => reply,
        Err(e) if e.is_retryable() => {
            return Ok(StageResult::TransientFailure {
                code: e.code(),
                message: e.to_string(),
            })
        }
        Err(e) => return Err(e),
    };

    let received = super::received_at(msg);
    let key = keys::payer_raw(&msg.submission_id, received);

    match reply {
        PayerReply::Decided {
            disposition,
            external_reference_id,
            body,
        } => {
            let bytes = serde_json::to_vec(&body)
                .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
            deps.store.put(&msg.payload_bucket, &key, &bytes).await?;
            Ok(StageResult::Advance(AdvanceInfo {
                artifact: Some(ArtifactRef::new(msg.payload_bucket.clone(), key)),
                external_reference_id,
                api_response_status: Some(disposition),
                ..AdvanceInfo::default()
            }))
        }
        PayerReply::Pended {
            external_reference_id,
            body,
        } => {
            // park the acknowledgement; the callback overwrites it with
            // the real reply later
            let bytes = serde_json::to_vec(&body)
                .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
            deps.store.put(&msg.payload_bucket, &key, &bytes).await?;
            Ok(StageResult::AwaitCallback {
                external_reference_id,
                artifact: Some(ArtifactRef::new(msg.payload_bucket.clone(), key)),
            })
        }
        PayerReply::Rejected { code, message, body } => {
            let bytes = serde_json::to_vec(&body)
                .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
            deps.store.put(&msg.payload_bucket, &key, &bytes).await?;
            Ok(StageResult::Advance(AdvanceInfo {
                artifact: Some(ArtifactRef::new(msg.payload_bucket.clone(), key)),
                api_response_status: Some("error".to_owned()),
                error: Some((code, message)),
                ..AdvanceInfo::default()
            }))
        }
    }
}

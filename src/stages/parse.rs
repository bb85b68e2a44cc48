use serde::Deserialize;

use super::AttachmentMeta;
use super::ParsedClaim;
use super::ParsedDocument;
use super::ServiceItem;
use crate::deps::Deps;
use crate::domain::AdvanceInfo;
use crate::domain::ArtifactRef;
use crate::domain::FanOutLeg;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::StageResult;
use crate::domain::ValidationIssue;
use crate::object_store::keys;

/// Inbound claim bundle as submitted by the provider. Everything is
/// optional here; this stage decides what is actually required.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    claim: Option<RawClaim>,
    #[serde(default)]
    attachments: Vec<AttachmentMeta>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClaim {
    claim_id: Option<String>,
    patient_reference: Option<String>,
    provider_npi: Option<String>,
    payer_id: Option<String>,
    service_date: Option<String>,
    #[serde(default)]
    items: Vec<ServiceItem>,
}

/// Extracts the structured claim from the raw bundle and writes
/// `parsed.json`. Structural requirements (the claim id above all) are
/// enforced here so a hopeless bundle never reaches the queue fan-out.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let bundle: RawBundle = match serde_json::from_slice(input) {
        Ok(bundle) => bundle,
        Err(e) => {
            return Ok(StageResult::ValidationFailure {
                issues: vec![ValidationIssue::error(
                    "MALFORMED_BUNDLE",
                    "$",
                    &format!("bundle is not valid JSON: {e}"),
                )],
            })
        }
    };

    let Some(claim) = bundle.claim else {
        return Ok(StageResult::ValidationFailure {
            issues: vec![ValidationIssue::error(
                "REQUIRED_FIELD_MISSING",
                "claim",
                "bundle carries no claim",
            )],
        });
    };
    let claim_id = match claim.claim_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            return Ok(StageResult::ValidationFailure {
                issues: vec![ValidationIssue::error(
                    "REQUIRED_FIELD_MISSING",
                    "claim.claimId",
                    "claim id is required",
                )],
            })
        }
    };

    let payer_id = claim.payer_id.clone();
    let parsed = ParsedDocument {
        submission_id: msg.submission_id.to_string(),
        tenant: msg.tenant.clone(),
        claim: ParsedClaim {
            claim_id,
            patient_reference: claim.patient_reference,
            provider_npi: claim.provider_npi,
            payer_id: claim.payer_id,
            service_date: claim.service_date,
            items: claim.items,
        },
        attachments: bundle.attachments,
        provider: None,
    };

    let bytes = serde_json::to_vec(&parsed)
        .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
    let received = super::received_at(msg);
    let key = keys::parsed(&msg.submission_id, received);
    deps.store.put(&msg.payload_bucket, &key, &bytes).await?;
    let artifact = ArtifactRef::new(msg.payload_bucket.clone(), key);

    // secondary extract for downstream consumers; non-blocking on
    // failure, which is a known data-completeness risk
    let parsed_data_path = match deps
        .store
        .put_parsed(
            &deps.settings.object_store.parsed_bucket,
            &msg.tenant,
            &msg.submission_id,
            &bytes,
        )
        .await
    {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::warn!(
                submission_id = %msg.submission_id,
                error = %e,
                "parsed-data extract failed; continuing without it"
            );
            None
        }
    };

    let attachment_count = parsed.attachments.len() as i64;
    let info = AdvanceInfo {
        artifact: Some(artifact.clone()),
        has_attachments: attachment_count > 0,
        attachment_count,
        parsed_data_path,
        payer_id,
        ..AdvanceInfo::default()
    };

    if attachment_count > 0 {
        Ok(StageResult::FanOut {
            legs: vec![
                FanOutLeg {
                    stage: Stage::Validate,
                    artifact: artifact.clone(),
                },
                FanOutLeg {
                    stage: Stage::Attachments,
                    artifact,
                },
            ],
            info,
        })
    } else {
        Ok(StageResult::Advance(info))
    }
}

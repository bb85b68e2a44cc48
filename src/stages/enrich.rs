use sqlx::Row;

use super::parse_document;
use super::ProviderDetail;
use crate::deps::Deps;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;
use crate::object_store::keys;

/// Grafts provider-registry detail onto the parsed claim and writes
/// `enriched.json`. A registry miss is logged and tolerated — the claim
/// continues unenriched, which is a known data-completeness risk.
pub async fn handle(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let mut parsed = parse_document(input)?;

    if let Some(npi) = parsed.claim.provider_npi.clone() {
        match lookup_provider(deps, &npi).await? {
            Some(detail) => parsed.provider = Some(detail),
            None => tracing::warn!(
                submission_id = %msg.submission_id,
                npi,
                "provider not in registry; continuing unenriched"
            ),
        }
    }

    let bytes = serde_json::to_vec(&parsed)
        .map_err(|e| PipelineError::transient(anyhow::anyhow!(e)))?;
    let received = super::received_at(msg);
    let key = keys::enriched(&msg.submission_id, received);
    deps.store.put(&msg.payload_bucket, &key, &bytes).await?;

    Ok(StageResult::advance(ArtifactRef::new(
        msg.payload_bucket.clone(),
        key,
    )))
}

async fn lookup_provider(
    deps: &Deps,
    npi: &str,
) -> Result<Option<ProviderDetail>, PipelineError> {
    let row = sqlx::query(
        "SELECT name, taxonomy_code, address FROM provider_registry
         WHERE npi = ? AND active = 1",
    )
    .bind(npi)
    .fetch_optional(&deps.pool)
    .await?;
    row.map(|r| {
        Ok(ProviderDetail {
            name: r.try_get("name")?,
            taxonomy_code: r.try_get("taxonomy_code")?,
            address: r.try_get("address")?,
        })
    })
    .transpose()
}

//! Stage handlers. Each one is a function
//! `handle(&Deps, &PipelineMessage, &[u8]) -> Result<StageResult, PipelineError>`:
//! it reads the inbound artifact, may write new artifacts through the
//! object store, and reports its outcome — the worker runtime owns every
//! tracker, outbox and bus mutation.

mod attachments;
mod build_response;
mod convert;
mod enrich;
mod notify;
mod parse;
mod payer_call;
mod validate;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::deps::Deps;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::StageResult;

/// Carried on the first envelope so every stage can derive the `{YYYYMM}`
/// object-key prefix without a tracker read.
pub const META_RECEIVED_AT: &str = "receivedAt";
pub const META_CORRELATION_ID: &str = "correlationId";

/// Dispatches to the stage named on the envelope.
pub async fn run(
    deps: &Deps,
    msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    match msg.stage {
        Stage::Parse => parse::handle(deps, msg, input).await,
        Stage::Validate => validate::handle(deps, msg, input).await,
        Stage::Enrich => enrich::handle(deps, msg, input).await,
        Stage::Attachments => attachments::handle(deps, msg, input).await,
        Stage::Convert => convert::handle(deps, msg, input).await,
        Stage::PayerCall => payer_call::handle(deps, msg, input).await,
        Stage::BuildResponse => build_response::handle(deps, msg, input).await,
        Stage::NotifySubscribers => notify::handle(deps, msg, input).await,
    }
}

/// Receive time of the submission, for key derivation. Falls back to the
/// envelope's creation time when the metadata entry is absent.
pub fn received_at(msg: &PipelineMessage) -> DateTime<Utc> {
    msg.metadata
        .get(META_RECEIVED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(msg.created_at)
}

// ---------------------------------------------------------------------
// Artifact documents exchanged between stages.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceItem {
    pub code: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub attachment_id: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Inline content as submitted; persisted to the object store by the
    /// attachments branch and dropped from later artifacts.
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedClaim {
    pub claim_id: String,
    #[serde(default)]
    pub patient_reference: Option<String>,
    #[serde(default)]
    pub provider_npi: Option<String>,
    #[serde(default)]
    pub payer_id: Option<String>,
    #[serde(default)]
    pub service_date: Option<String>,
    #[serde(default)]
    pub items: Vec<ServiceItem>,
}

/// Provider detail grafted on by the enrich stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDetail {
    pub name: String,
    #[serde(default)]
    pub taxonomy_code: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// The `parsed.json` / `enriched.json` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDocument {
    pub submission_id: String,
    pub tenant: String,
    pub claim: ParsedClaim,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderDetail>,
}

pub fn parse_document(input: &[u8]) -> Result<ParsedDocument, PipelineError> {
    Ok(serde_json::from_slice(input)?)
}

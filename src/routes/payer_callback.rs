use actix_web::web;
use actix_web::HttpResponse;
use chrono::Utc;
use uuid::Uuid;

use crate::audit;
use crate::bus;
use crate::deps::Deps;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::SubmissionId;
use crate::object_store::keys;
use crate::stages::META_RECEIVED_AT;
use crate::tracker;
use crate::utils::error_400;
use crate::utils::error_500;

/// `POST /payer-callback/{submissionId}` — boundary adapter for payers
/// that answered `pended`. Stores the real reply and re-injects exactly
/// one message at `build-response`, resuming the parked pipeline.
#[tracing::instrument(skip(deps, body))]
pub async fn payer_callback(
    path: web::Path<String>,
    body: web::Json<serde_json::Value>,
    deps: web::Data<Deps>,
) -> Result<HttpResponse, actix_web::Error> {
    let submission_id = SubmissionId::parse(&path).map_err(error_400)?;
    let Some(row) = tracker::get(&deps.pool, &submission_id)
        .await
        .map_err(error_500)?
    else {
        return Ok(HttpResponse::NotFound().finish());
    };

    let disposition = body
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| error_400("callback body carries no status"))?
        .to_owned();

    // single-winner flip: a concurrent or repeated callback loses here
    // and cannot double-inject a resume message
    if !tracker::try_begin_callback(&deps.pool, &submission_id)
        .await
        .map_err(error_500)?
    {
        return Ok(HttpResponse::Conflict().json(serde_json::json!({
            "error": "submission is not awaiting a payer callback",
            "status": row.status,
        })));
    }

    // the real reply replaces the parked acknowledgement
    let bucket = row
        .payer_reply_ref
        .as_ref()
        .map(|r| r.bucket.clone())
        .unwrap_or_else(|| deps.settings.object_store.artifact_bucket.clone());
    let key = keys::payer_raw(&submission_id, row.received_at);
    let bytes = serde_json::to_vec(&body.into_inner()).map_err(error_500)?;
    deps.store
        .put(&bucket, &key, &bytes)
        .await
        .map_err(error_500)?;

    let now = Utc::now();
    let mut msg = PipelineMessage {
        submission_id: submission_id.clone(),
        message_id: Uuid::new_v4(),
        schema_version: "1.0".to_owned(),
        stage: Stage::BuildResponse,
        tenant: row.tenant.clone(),
        payload_bucket: bucket,
        payload_key: key,
        parsed_data_s3_path: None,
        has_attachments: false,
        attachment_count: 0,
        external_reference_id: row.external_reference_id.clone(),
        api_response_status: Some(disposition),
        error_code: None,
        error_message: None,
        metadata: std::collections::HashMap::new(),
        created_at: now,
    };
    msg.metadata
        .insert(META_RECEIVED_AT.to_owned(), row.received_at.to_rfc3339());

    let queue = deps
        .settings
        .pipeline
        .resolve_queue(Stage::BuildResponse.queue());
    let payload = msg.to_json().map_err(error_500)?;
    bus::send(
        &deps.pool,
        &queue,
        submission_id.as_ref(),
        &msg.message_id.to_string(),
        &payload,
        None,
    )
    .await
    .map_err(error_500)?;

    audit::record_pool(&deps.pool, Some(&submission_id), &row.tenant, "payer-callback", None)
        .await
        .map_err(error_500)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "accepted" })))
}

use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::audit;
use crate::deps::Deps;
use crate::domain::ArtifactRef;
use crate::domain::PipelineMessage;
use crate::domain::Stage;
use crate::domain::SubmissionId;
use crate::domain::ValidationIssue;
use crate::idempotency;
use crate::idempotency::IdempotencyKey;
use crate::idempotency::NextAction;
use crate::object_store::keys;
use crate::outbox;
use crate::stages::META_CORRELATION_ID;
use crate::stages::META_RECEIVED_AT;
use crate::sync_path;
use crate::sync_path::SyncOutcome;
use crate::tracker;
use crate::tracker::NewTracker;
use crate::utils::error_400;
use crate::utils::error_500;

#[derive(Deserialize)]
pub struct SubmitQuery {
    #[serde(rename = "syncMode", default)]
    sync_mode: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    submission_id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    claim_response_bundle: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation_errors: Option<Vec<ValidationIssue>>,
}

impl SubmitResponse {
    fn bare(submission_id: &str, status: &'static str) -> Self {
        Self {
            submission_id: submission_id.to_owned(),
            status,
            claim_response_bundle: None,
            validation_errors: None,
        }
    }
}

/// `POST /submit?syncMode={true|false}` — the orchestrator front-door.
///
/// Accepts a claim bundle, deduplicates on the idempotency key, persists
/// the raw payload, creates the tracker row and stages the first pipeline
/// message — then either drives the bounded sync path or returns 202 and
/// lets the publisher drain the staged row.
#[tracing::instrument(
    name = "Accepting submission",
    skip_all,
    fields(submission_id = tracing::field::Empty, tenant = tracing::field::Empty)
)]
pub async fn submit(
    req: HttpRequest,
    query: web::Query<SubmitQuery>,
    body: web::Bytes,
    deps: web::Data<Deps>,
) -> Result<HttpResponse, actix_web::Error> {
    let correlation_id = header(&req, "X-Correlation-ID")
        .ok_or_else(|| error_400("missing required header X-Correlation-ID"))?;
    let tenant =
        header(&req, "X-Tenant-ID").unwrap_or_else(|| deps.settings.application.tenant.clone());
    let idempotency_key = match header(&req, "X-Idempotency-Key") {
        Some(raw) => Some(IdempotencyKey::try_from(raw).map_err(error_400)?),
        None => None,
    };
    tracing::Span::current().record("tenant", tracing::field::display(&tenant));

    // the gate only requires well-formed JSON; contract checks belong to
    // the pipeline
    serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| error_400(format!("body is not valid JSON: {e}")))?;

    let now = Utc::now();
    let submission_id = SubmissionId::generate(now);
    tracing::Span::current().record("submission_id", tracing::field::display(&submission_id));

    // idempotency gate first: a duplicate must cause no side effects
    if let Some(key) = &idempotency_key {
        let hash = idempotency::request_hash(&body);
        let ttl = chrono::Duration::hours(deps.settings.idempotency.ttl_hours);
        let mut tx = deps.pool.begin().await.map_err(error_500)?;
        let action = idempotency::check_and_set(&mut tx, &tenant, key, &submission_id, &hash, ttl)
            .await
            .map_err(error_500)?;
        tx.commit().await.map_err(error_500)?;
        if let NextAction::ReturnDuplicate(prior) = action {
            tracing::info!(prior = %prior.submission_id, "duplicate idempotency key");
            return Ok(HttpResponse::Ok()
                .json(SubmitResponse::bare(&prior.submission_id, "duplicate")));
        }
    }

    let bucket = deps.settings.object_store.artifact_bucket.clone();
    let raw_key = keys::raw(&submission_id, now);
    deps.store
        .put(&bucket, &raw_key, &body)
        .await
        .map_err(error_500)?;
    let raw_ref = ArtifactRef::new(bucket, raw_key);

    // creation transaction: tracker row, audit trail and the first outbox
    // row commit atomically — the pipeline exists exactly once, in both
    // sync and async mode
    let mut envelope =
        PipelineMessage::initial(submission_id.clone(), tenant.clone(), &raw_ref, now);
    envelope
        .metadata
        .insert(META_RECEIVED_AT.to_owned(), now.to_rfc3339());
    envelope
        .metadata
        .insert(META_CORRELATION_ID.to_owned(), correlation_id.clone());

    let mut tx = deps.pool.begin().await.map_err(error_500)?;
    tracker::create(
        &mut tx,
        &NewTracker {
            submission_id: submission_id.clone(),
            tenant: tenant.clone(),
            source_system: header(&req, "X-Source-System"),
            request_type: "prior-auth".to_owned(),
            idempotency_key: idempotency_key.as_ref().map(|k| k.as_ref().to_owned()),
            correlation_id: Some(correlation_id.clone()),
            raw_ref,
            contains_phi: true,
            phi_encrypted: deps.store.encrypted_at_rest(),
            received_at: now,
            expires_at: None,
        },
    )
    .await
    .map_err(error_500)?;
    audit::record(
        &mut tx,
        Some(&submission_id),
        &tenant,
        "submission-received",
        Some(&correlation_id),
    )
    .await
    .map_err(error_500)?;
    // with a sync window ahead, hold the first row away from the
    // publisher: the sync runner consumes it in process
    let sync_requested = query.sync_mode.unwrap_or(false) && deps.settings.sync.enabled;
    let hold = sync_requested.then(|| deps.settings.sync.deadline());
    outbox::write(
        &mut tx,
        Stage::Parse,
        &envelope,
        deps.settings.outbox.max_retries,
        hold,
    )
    .await
    .map_err(error_500)?;
    tx.commit().await.map_err(error_500)?;

    if sync_requested {
        match sync_path::run_bounded(&deps, &submission_id)
            .await
            .map_err(error_500)?
        {
            SyncOutcome::Approved => {
                tracker::record_sync_processed(&deps.pool, &submission_id)
                    .await
                    .map_err(error_500)?;
                // the async continuation still runs the full pipeline
                tracker::try_mark_async_queued(&deps.pool, &submission_id)
                    .await
                    .map_err(error_500)?;
                return Ok(HttpResponse::Ok().json(SubmitResponse {
                    submission_id: submission_id.to_string(),
                    status: "approved",
                    claim_response_bundle: Some(serde_json::json!({
                        "resourceType": "ClaimResponseBundle",
                        "submissionId": submission_id,
                        "disposition": "APPROVED",
                        "provisional": true,
                    })),
                    validation_errors: None,
                }));
            }
            SyncOutcome::Invalid(issues) => {
                return Ok(HttpResponse::Ok().json(SubmitResponse {
                    submission_id: submission_id.to_string(),
                    status: "error",
                    claim_response_bundle: None,
                    validation_errors: Some(issues),
                }));
            }
            SyncOutcome::Pended => {
                tracker::try_mark_async_queued(&deps.pool, &submission_id)
                    .await
                    .map_err(error_500)?;
                return Ok(HttpResponse::Ok().json(SubmitResponse::bare(
                    submission_id.as_ref(),
                    "pended",
                )));
            }
        }
    }

    // async arm: the first message is already staged; the latch only
    // records activation (a false return means a concurrent path won)
    tracker::try_mark_async_queued(&deps.pool, &submission_id)
        .await
        .map_err(error_500)?;
    Ok(HttpResponse::Accepted().json(SubmitResponse::bare(submission_id.as_ref(), "accepted")))
}

fn header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

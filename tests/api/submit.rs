use claims::assert_some;

use crate::helpers::bundle_missing_claim_id;
use crate::helpers::mock_payer_approved;
use crate::helpers::spawn_app;
use crate::helpers::valid_bundle;

#[tokio::test]
async fn submit_without_correlation_id_is_rejected() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(format!("{}/submit?syncMode=false", app.addr))
        .json(&valid_bundle())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn submit_with_malformed_json_is_rejected() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(format!("{}/submit?syncMode=false", app.addr))
        .header("X-Correlation-ID", "corr-1")
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn async_submission_is_accepted_and_runs_to_completion() {
    let app = spawn_app().await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&valid_bundle(), false, None).await;
    assert_eq!(response.status().as_u16(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "accepted");
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "COMPLETED").await;
    assert_eq!(snapshot["lastStage"], "notify-subscribers");
    assert_eq!(snapshot["asyncQueued"], true);
    assert_eq!(snapshot["externalReferenceId"], "payer-ref-001");
    assert_some!(snapshot["completedAt"].as_str());
    assert_some!(snapshot["finalResponseRef"]["key"].as_str());

    // one outbox row per stage transition, all published
    let rows = app.outbox_rows(&submission_id).await;
    let destinations: Vec<&str> = rows.iter().map(|(d, _)| d.as_str()).collect();
    assert_eq!(
        destinations,
        vec![
            "parse",
            "validate",
            "enrich",
            "convert",
            "payer-call",
            "build-response",
            "notify-subscribers",
        ]
    );
    assert!(rows.iter().all(|(_, status)| status == "SENT"));
}

// S1: happy sync-approved.
#[tokio::test]
async fn sync_submission_returns_approved_and_pipeline_still_completes() {
    let app = spawn_app().await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&valid_bundle(), true, None).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "approved");
    assert_eq!(body["claimResponseBundle"]["disposition"], "APPROVED");
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "COMPLETED").await;
    assert_eq!(snapshot["syncProcessed"], true);

    // every stage transition staged exactly once, even though parse and
    // validate ran in process
    let rows = app.outbox_rows(&submission_id).await;
    let destinations: Vec<&str> = rows.iter().map(|(d, _)| d.as_str()).collect();
    assert_eq!(
        destinations,
        vec![
            "parse",
            "validate",
            "enrich",
            "convert",
            "payer-call",
            "build-response",
            "notify-subscribers",
        ]
    );
    assert!(rows.iter().all(|(_, status)| status == "SENT"));

    // matching START/OK pairs per stage
    let events = app.events(&submission_id).await;
    for stage in [
        "parse",
        "validate",
        "enrich",
        "convert",
        "payer-call",
        "build-response",
        "notify-subscribers",
    ] {
        let starts = events
            .iter()
            .filter(|(_, s, t, _)| s == stage && t == "STAGE_START")
            .count();
        let oks = events
            .iter()
            .filter(|(_, s, t, _)| s == stage && t == "STAGE_OK")
            .count();
        assert_eq!(starts, 1, "stage {stage} should start exactly once");
        assert_eq!(oks, 1, "stage {stage} should succeed exactly once");
    }
}

// S2: validation failure surfaces synchronously.
#[tokio::test]
async fn missing_claim_id_fails_synchronously() {
    let app = spawn_app().await;

    let response = app.post_submit(&bundle_missing_claim_id(), true, None).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["validationErrors"][0]["code"], "REQUIRED_FIELD_MISSING");
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "FAILED").await;
    assert_eq!(snapshot["lastErrorCode"], "REQUIRED_FIELD_MISSING");

    // nothing staged past parse
    let rows = app.outbox_rows(&submission_id).await;
    let destinations: Vec<&str> = rows.iter().map(|(d, _)| d.as_str()).collect();
    assert_eq!(destinations, vec!["parse"]);
}

#[tokio::test]
async fn corrupt_npi_fails_validation_synchronously() {
    let app = spawn_app().await;

    let mut bundle = valid_bundle();
    bundle["claim"]["providerNpi"] = serde_json::json!("1234567890");
    let response = app.post_submit(&bundle, true, None).await;
    let body: serde_json::Value = response.json().await.unwrap();

    assert_eq!(body["status"], "error");
    assert_eq!(body["validationErrors"][0]["code"], "INVALID_NPI");
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();
    app.wait_for_status(&submission_id, "FAILED").await;
}

// S3: idempotent replay.
#[tokio::test]
async fn duplicate_idempotency_key_returns_prior_submission_without_side_effects() {
    let app = spawn_app().await;
    mock_payer_approved(&app.payer_server).await;

    let bundle = valid_bundle();
    let first = app.post_submit(&bundle, false, Some("op-retry-1")).await;
    assert_eq!(first.status().as_u16(), 202);
    let first_body: serde_json::Value = first.json().await.unwrap();
    let first_id = first_body["submissionId"].as_str().unwrap().to_owned();

    app.wait_for_status(&first_id, "COMPLETED").await;
    let rows_before = app.outbox_rows(&first_id).await.len();

    let second = app.post_submit(&bundle, false, Some("op-retry-1")).await;
    assert_eq!(second.status().as_u16(), 200);
    let second_body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second_body["status"], "duplicate");
    assert_eq!(second_body["submissionId"], first_id.as_str());

    // exactly one tracker row, zero additional outbox rows
    assert_eq!(app.tracker_row_count().await, 1);
    assert_eq!(app.outbox_rows(&first_id).await.len(), rows_before);
}

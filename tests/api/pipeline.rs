use chrono::Utc;
use pagw::bus;
use pagw::domain::ArtifactRef;
use pagw::domain::SubmissionId;
use pagw::tracker;
use pagw::tracker::NewTracker;
use sqlx::Row;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use crate::helpers::bundle_with_attachments;
use crate::helpers::mock_payer_approved;
use crate::helpers::spawn_app;
use crate::helpers::spawn_app_with;
use crate::helpers::valid_bundle;

// S4: the sync window closes before a definitive outcome; the async arm
// finishes the job.
#[tokio::test]
async fn sync_timeout_pends_then_completes_asynchronously() {
    let app = spawn_app_with(|cfg| cfg.sync.deadline_ms = 0).await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&valid_bundle(), true, None).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "pended");
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "COMPLETED").await;
    assert_eq!(snapshot["asyncQueued"], true);

    // notify-subscribers fired exactly once
    let deliveries = app.subscriber_server.received_requests().await.unwrap();
    assert_eq!(deliveries.len(), 1);
}

// S5: transient payer error, then success on redelivery.
#[tokio::test]
async fn transient_payer_error_retries_to_completion() {
    let app = spawn_app().await;

    // first call gets a 503, every later one an approval
    Mock::given(method("POST"))
        .and(path("/prior-auth"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&app.payer_server)
        .await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&valid_bundle(), false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    app.wait_for_status(&submission_id, "COMPLETED").await;

    let events = app.events(&submission_id).await;
    let payer_events: Vec<_> = events
        .iter()
        .filter(|(_, stage, _, _)| stage == "payer-call")
        .collect();
    let starts = payer_events
        .iter()
        .filter(|(_, _, t, _)| t == "STAGE_START")
        .count();
    let oks = payer_events
        .iter()
        .filter(|(_, _, t, _)| t == "STAGE_OK")
        .count();
    let retryable_fails = payer_events
        .iter()
        .filter(|(_, _, t, retryable)| t == "STAGE_FAIL" && *retryable == Some(true))
        .count();
    assert_eq!(starts, 2, "one start per attempt");
    assert_eq!(oks, 1, "only the second attempt succeeds");
    assert_eq!(retryable_fails, 1, "the 503 is recorded as retryable");
}

// S6 / P7: a poison message is isolated on the DLQ without advancing the
// pipeline.
#[tokio::test]
async fn poison_message_lands_on_the_dlq_and_parks_the_tracker() {
    let app = spawn_app().await;

    // a submission that is mid-pipeline as far as the tracker knows
    let submission_id = SubmissionId::generate(Utc::now());
    let mut tx = app.pool.begin().await.unwrap();
    tracker::create(
        &mut tx,
        &NewTracker {
            submission_id: submission_id.clone(),
            tenant: "default".to_owned(),
            source_system: None,
            request_type: "prior-auth".to_owned(),
            idempotency_key: None,
            correlation_id: Some("corr-poison".to_owned()),
            raw_ref: ArtifactRef::new("pagw-artifacts", "202603/x/request/raw.json"),
            contains_phi: true,
            phi_encrypted: false,
            received_at: Utc::now(),
            expires_at: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    bus::send(
        &app.pool,
        "enrich",
        submission_id.as_ref(),
        "poison-1",
        "this is not an envelope",
        None,
    )
    .await
    .unwrap();

    let snapshot = app.wait_for_status(submission_id.as_ref(), "ENRICHMENT_ERROR").await;
    assert_eq!(snapshot["lastStage"], serde_json::Value::Null);

    assert_eq!(app.queue_depth("dlq").await, 1);
    assert_eq!(app.queue_depth("enrich").await, 0);
    assert_eq!(app.queue_depth("convert").await, 0);

    let events = app.events(submission_id.as_ref()).await;
    assert!(events.iter().any(|(_, _, t, _)| t == "POISON"));
}

// P9: the attachments branch converges on its own terminal event and the
// main path completes independently.
#[tokio::test]
async fn attachments_run_on_the_side_path_and_both_branches_terminate() {
    let app = spawn_app().await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&bundle_with_attachments(), false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    app.wait_for_status(&submission_id, "COMPLETED").await;

    // branch terminal event appears alongside the main-path completion
    let wait_deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let events = app.events(&submission_id).await;
        let branch_done = events
            .iter()
            .any(|(_, stage, t, _)| stage == "attachments" && t == "BRANCH_COMPLETE");
        if branch_done {
            break;
        }
        if std::time::Instant::now() > wait_deadline {
            panic!("attachments branch never terminated; events={events:#?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let stored: i64 =
        sqlx::query("SELECT COUNT(*) AS n FROM attachment_tracker WHERE submission_id = ?")
            .bind(&submission_id)
            .fetch_one(&app.pool)
            .await
            .unwrap()
            .get("n");
    assert_eq!(stored, 2);

    // P2: the timeline is strictly ordered
    let events = app.events(&submission_id).await;
    for pair in events.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }

    // P6: main-path stage starts follow the pipeline order
    let main_starts: Vec<&str> = events
        .iter()
        .filter(|(_, stage, t, _)| t == "STAGE_START" && stage != "attachments")
        .map(|(_, stage, _, _)| stage.as_str())
        .collect();
    assert_eq!(
        main_starts,
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
}

// The payer-call stage's distinguished behavior: a pended reply parks the
// submission until the callback adapter re-injects at build-response.
#[tokio::test]
async fn pended_payer_reply_waits_for_the_callback() {
    let app = spawn_app().await;

    Mock::given(method("POST"))
        .and(path("/prior-auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "pended",
            "externalReferenceId": "payer-async-42",
        })))
        .mount(&app.payer_server)
        .await;

    let response = app.post_submit(&valid_bundle(), false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "AWAITING_CALLBACK").await;
    assert_eq!(snapshot["externalReferenceId"], "payer-async-42");

    // no message reached build-response yet
    assert_eq!(app.queue_depth("build-response").await, 0);

    let callback = app
        .client
        .post(format!("{}/payer-callback/{submission_id}", app.addr))
        .json(&serde_json::json!({
            "status": "approved",
            "externalReferenceId": "payer-async-42",
            "decision": { "authorizationNumber": "AUTH-9" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(callback.status().as_u16(), 200);

    app.wait_for_status(&submission_id, "COMPLETED").await;

    // a second callback is rejected: the submission is no longer waiting
    let replay = app
        .client
        .post(format!("{}/payer-callback/{submission_id}", app.addr))
        .json(&serde_json::json!({ "status": "approved" }))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status().as_u16(), 409);
}

// A payer 4xx is a business outcome: the pipeline completes with errors
// instead of failing.
#[tokio::test]
async fn payer_rejection_completes_with_errors() {
    let app = spawn_app().await;

    Mock::given(method("POST"))
        .and(path("/prior-auth"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "errorCode": "MEMBER_NOT_COVERED",
            "errorMessage": "member not covered for requested service",
        })))
        .mount(&app.payer_server)
        .await;

    let response = app.post_submit(&valid_bundle(), false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    app.wait_for_status(&submission_id, "COMPLETED_WITH_ERRORS").await;

    // the rejection still produced a delivered final response
    let deliveries = app.subscriber_server.received_requests().await.unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivered: serde_json::Value = serde_json::from_slice(&deliveries[0].body).unwrap();
    assert_eq!(delivered["errors"][0]["code"], "MEMBER_NOT_COVERED");
}

// An unknown payer is caught by convert, asynchronously.
#[tokio::test]
async fn unsupported_payer_terminalizes_the_submission() {
    let app = spawn_app().await;

    let mut bundle = valid_bundle();
    bundle["claim"]["payerId"] = serde_json::json!("payer-unknown");
    let response = app.post_submit(&bundle, false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "FAILED").await;
    assert_eq!(snapshot["lastErrorCode"], "UNSUPPORTED_PAYER");
}

/// Subscriber outage: delivery fails transiently, then succeeds once the
/// endpoint recovers.
#[tokio::test]
async fn subscriber_outage_retries_delivery() {
    // a flaky subscriber replaces the default permissive one
    let flaky = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&flaky)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&flaky)
        .await;

    let app = spawn_app_with(|cfg| {
        cfg.subscribers.endpoints = vec![format!("{}/webhook", flaky.uri())];
    })
    .await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&valid_bundle(), false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    app.wait_for_status(&submission_id, "COMPLETED").await;
    assert_eq!(flaky.received_requests().await.unwrap().len(), 2);
}

use crate::helpers::mock_payer_approved;
use crate::helpers::spawn_app;
use crate::helpers::valid_bundle;

#[tokio::test]
async fn status_of_an_unknown_submission_is_404() {
    let app = spawn_app().await;

    let response = app.get_status("20260101000000-000000-zzzzzz").await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn status_of_a_malformed_id_is_400() {
    let app = spawn_app().await;

    let response = app.get_status("not-a-submission-id").await;
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn status_snapshot_carries_lifecycle_fields() {
    let app = spawn_app().await;
    mock_payer_approved(&app.payer_server).await;

    let response = app.post_submit(&valid_bundle(), false, None).await;
    let body: serde_json::Value = response.json().await.unwrap();
    let submission_id = body["submissionId"].as_str().unwrap().to_owned();

    let snapshot = app.wait_for_status(&submission_id, "COMPLETED").await;
    assert_eq!(snapshot["submissionId"], submission_id.as_str());
    assert_eq!(snapshot["tenant"], "default");
    assert_eq!(snapshot["requestType"], "prior-auth");
    assert!(snapshot["receivedAt"].is_string());
    assert!(snapshot["completedAt"].is_string());
    assert!(snapshot["rawRef"]["key"]
        .as_str()
        .unwrap()
        .ends_with("/request/raw.json"));
    assert!(snapshot["parsedRef"]["key"]
        .as_str()
        .unwrap()
        .ends_with("/request/parsed.json"));
    assert!(snapshot["payerReplyRef"]["key"]
        .as_str()
        .unwrap()
        .ends_with("/response/payer-raw.json"));
    assert!(snapshot["finalResponseRef"]["key"]
        .as_str()
        .unwrap()
        .ends_with("/response/final.json"));
}

use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use pagw::configuration::get_configuration;
use pagw::configuration::Settings;
use pagw::startup::get_connection_pool;
use pagw::startup::Application;
use pagw::telemetry::get_subscriber;
use pagw::telemetry::init_subscriber;
use sqlx::Row;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

/// A provider NPI with a valid check digit, present in the seeded
/// registry.
pub const GOOD_NPI: &str = "1234567893";
pub const PAYER_ID: &str = "payer-acme";

// Init the subscriber once; `TEST_LOG=true cargo test | bunyan` for
// verbose output.
static TRACING: Lazy<()> = Lazy::new(|| match std::env::var("TEST_LOG") {
    Ok(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::stdout);
        init_subscriber(subscriber);
    }
    Err(_) => {
        let subscriber = get_subscriber("test", "debug", std::io::sink);
        init_subscriber(subscriber);
    }
});

pub struct TestApp {
    pub addr: String,
    pub pool: SqlitePool,
    pub payer_server: MockServer,
    pub subscriber_server: MockServer,
    pub client: reqwest::Client,
    // temp dirs must outlive the app
    _scratch: TempDir,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

/// Spawns the API plus all background workers against a throwaway
/// database and object store. `customize` tweaks settings after the
/// test defaults are applied.
pub async fn spawn_app_with(customize: impl FnOnce(&mut Settings)) -> TestApp {
    Lazy::force(&TRACING);

    let payer_server = MockServer::start().await;
    let subscriber_server = MockServer::start().await;
    let scratch = tempfile::tempdir().expect("failed to create scratch dir");

    let cfg = {
        let mut cfg = get_configuration().expect("failed to read configuration");
        cfg.application.port = 0;
        cfg.database.path = scratch.path().join("pagw.db");
        cfg.object_store.root = scratch.path().join("store");
        cfg.payer.base_url = payer_server.uri();
        cfg.subscribers.endpoints = vec![format!("{}/webhook", subscriber_server.uri())];
        // keep the suite fast
        cfg.pipeline.poll_interval_ms = 20;
        cfg.pipeline.visibility_timeout_ms = 5_000;
        cfg.outbox.poll_interval_ms = 20;
        cfg.outbox.backoff_base_ms = 20;
        cfg.outbox.backoff_cap_ms = 500;
        customize(&mut cfg);
        cfg
    };

    // subscribers accept deliveries unless a test mounts something
    // stricter
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&subscriber_server)
        .await;

    let app = Application::build(cfg.clone())
        .await
        .expect("failed to build application");
    let addr = format!("http://127.0.0.1:{}", app.port());
    let pool = get_connection_pool(&cfg.database);

    seed_reference_data(&pool).await;

    tokio::spawn(app.run_until_stopped());
    tokio::spawn(pagw::worker::init_stage_workers(cfg.clone()));
    tokio::spawn(pagw::outbox::init_publisher(cfg.clone()));

    TestApp {
        addr,
        pool,
        payer_server,
        subscriber_server,
        client: reqwest::Client::new(),
        _scratch: scratch,
    }
}

/// The enrich and convert stages read operator-managed reference tables;
/// give them one provider and one payer to work with.
async fn seed_reference_data(pool: &SqlitePool) {
    sqlx::query(
        "INSERT INTO provider_registry (npi, name, taxonomy_code, address, active, updated_at)
         VALUES (?, 'Dr. Example Provider', '207Q00000X', '1 Main St', 1, ?)",
    )
    .bind(GOOD_NPI)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("failed to seed provider registry");

    sqlx::query(
        "INSERT INTO payer_configuration
            (payer_id, name, format_version, endpoint_path, enabled, updated_at)
         VALUES (?, 'Acme Health', 'X12-278', '/prior-auth', 1, ?)",
    )
    .bind(PAYER_ID)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("failed to seed payer configuration");
}

impl TestApp {
    pub async fn post_submit(
        &self,
        body: &serde_json::Value,
        sync_mode: bool,
        idempotency_key: Option<&str>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("{}/submit?syncMode={sync_mode}", self.addr))
            .header("X-Correlation-ID", Uuid::new_v4().to_string())
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header("X-Idempotency-Key", key);
        }
        request.send().await.expect("submit request failed")
    }

    pub async fn get_status(&self, submission_id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/status/{submission_id}", self.addr))
            .send()
            .await
            .expect("status request failed")
    }

    /// Polls the status endpoint until the tracker reaches `expected`,
    /// dumping the timeline on timeout.
    pub async fn wait_for_status(&self, submission_id: &str, expected: &str) -> serde_json::Value {
        let deadline = std::time::Instant::now() + Duration::from_secs(15);
        loop {
            let response = self.get_status(submission_id).await;
            if response.status().as_u16() == 200 {
                let snapshot: serde_json::Value = response.json().await.unwrap();
                if snapshot["status"] == expected {
                    return snapshot;
                }
                if std::time::Instant::now() > deadline {
                    panic!(
                        "timed out waiting for {expected}; tracker={snapshot:#}, events={:#?}, outbox={:?}",
                        self.events(submission_id).await,
                        self.outbox_rows(submission_id).await,
                    );
                }
            } else if std::time::Instant::now() > deadline {
                panic!("timed out waiting for a tracker row for {submission_id}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// `(destination, status)` outbox rows for a submission.
    pub async fn outbox_rows(&self, submission_id: &str) -> Vec<(String, String)> {
        sqlx::query(
            "SELECT destination, status FROM outbox WHERE aggregate_id = ? ORDER BY created_at, id",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .unwrap()
        .iter()
        .map(|r| (r.get("destination"), r.get("status")))
        .collect()
    }

    /// `(sequence_no, stage, event_type, retryable)` timeline rows.
    pub async fn events(&self, submission_id: &str) -> Vec<(i64, String, String, Option<bool>)> {
        sqlx::query(
            "SELECT sequence_no, stage, event_type, retryable
             FROM event_tracker WHERE submission_id = ? ORDER BY sequence_no",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await
        .unwrap()
        .iter()
        .map(|r| {
            (
                r.get("sequence_no"),
                r.get("stage"),
                r.get("event_type"),
                r.get("retryable"),
            )
        })
        .collect()
    }

    pub async fn tracker_row_count(&self) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM request_tracker")
            .fetch_one(&self.pool)
            .await
            .unwrap()
            .get("n")
    }

    pub async fn queue_depth(&self, queue: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .unwrap()
            .get("n")
    }
}

pub fn valid_bundle() -> serde_json::Value {
    serde_json::json!({
        "claim": {
            "claimId": format!("claim-{}", Uuid::new_v4()),
            "patientReference": "patient/123",
            "providerNpi": GOOD_NPI,
            "payerId": PAYER_ID,
            "serviceDate": "2026-03-01",
            "items": [{ "code": "97110", "quantity": 2 }],
        },
        "attachments": [],
    })
}

pub fn bundle_with_attachments() -> serde_json::Value {
    let mut bundle = valid_bundle();
    bundle["attachments"] = serde_json::json!([
        { "attachmentId": "att-1", "contentType": "application/pdf", "data": "JVBERi0x" },
        { "attachmentId": "att-2", "contentType": "image/png", "data": "iVBORw0K" },
    ]);
    bundle
}

pub fn bundle_missing_claim_id() -> serde_json::Value {
    serde_json::json!({
        "claim": {
            "patientReference": "patient/123",
            "providerNpi": GOOD_NPI,
            "payerId": PAYER_ID,
            "items": [{ "code": "97110", "quantity": 1 }],
        },
    })
}

/// Mounts a payer that approves everything.
pub async fn mock_payer_approved(server: &MockServer) {
    Mock::given(method("POST"))
        .and(wiremock::matchers::path("/prior-auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "approved",
            "externalReferenceId": "payer-ref-001",
        })))
        .mount(server)
        .await;
}

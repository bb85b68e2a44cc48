use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::FileFormat;
use secrecy::Secret;
use serde::Deserialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;

/// Gateway configuration, loaded once at startup. No environment variable
/// is consulted anywhere else.
#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub object_store: ObjectStoreSettings,
    pub payer: PayerSettings,
    pub subscribers: SubscriberSettings,
    pub pipeline: PipelineSettings,
    pub sync: SyncSettings,
    pub outbox: OutboxSettings,
    pub idempotency: IdempotencySettings,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    /// Default tenant applied when the caller omits `X-Tenant-ID`.
    pub tenant: String,
    pub region: String,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl DatabaseSettings {
    pub fn connection(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            // WAL lets stage workers read while the publisher writes
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .foreign_keys(true)
    }
}

#[derive(Deserialize, Clone)]
pub struct ObjectStoreSettings {
    /// Root directory; each bucket is a subdirectory.
    pub root: PathBuf,
    pub artifact_bucket: String,
    pub parsed_bucket: String,
    /// Stands in for KMS delegation; recorded as `phi_encrypted` on the
    /// tracker.
    pub encrypted_at_rest: bool,
}

#[derive(Deserialize, Clone)]
pub struct PayerSettings {
    pub base_url: String,
    pub authorization_token: Secret<String>,
    pub timeout_ms: u64,
}

impl PayerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Clone)]
pub struct SubscriberSettings {
    pub endpoints: Vec<String>,
    pub timeout_ms: u64,
}

impl SubscriberSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Deserialize, Clone)]
pub struct PipelineSettings {
    pub poll_interval_ms: u64,
    pub visibility_timeout_ms: u64,
    pub max_receive_count: i64,
    pub stage_timeout_ms: u64,
    pub payer_stage_timeout_ms: u64,
    /// Logical queue name -> concrete queue name. Unlisted queues resolve
    /// to their logical name.
    #[serde(default)]
    pub queue_overrides: HashMap<String, String>,
}

impl PipelineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// Per-stage invocation deadline; the payer-call stage gets a larger
    /// budget.
    pub fn stage_timeout(&self, stage: &str) -> Duration {
        if stage == "payer-call" {
            Duration::from_millis(self.payer_stage_timeout_ms)
        } else {
            Duration::from_millis(self.stage_timeout_ms)
        }
    }

    pub fn resolve_queue(&self, logical: &str) -> String {
        self.queue_overrides
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_owned())
    }
}

#[derive(Deserialize, Clone)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Hard cap on the whole synchronous window; the contract-level
    /// ceiling is 15 s, so this must stay below it.
    pub deadline_ms: u64,
    pub stage_deadline_ms: u64,
}

impl SyncSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn stage_deadline(&self) -> Duration {
        Duration::from_millis(self.stage_deadline_ms)
    }
}

#[derive(Deserialize, Clone)]
pub struct OutboxSettings {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_retries: i64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl OutboxSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Clone)]
pub struct IdempotencySettings {
    pub ttl_hours: i64,
    pub sweep_interval_secs: u64,
}

/// Loads `configuration.yaml` from the working directory. All fields must
/// be present; invalid configuration fails startup immediately.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::new("configuration.yaml", FileFormat::Yaml))
        .build()?;
    settings.try_deserialize()
}

use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::configuration::Settings;

async fn expire_old_keys(pool: &SqlitePool) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("DELETE FROM idempotency WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

async fn expire_keys_loop(pool: &SqlitePool, sweep_interval: Duration) -> Result<(), anyhow::Error> {
    loop {
        match expire_old_keys(pool).await {
            Ok(pruned) if pruned > 0 => {
                tracing::info!(pruned, "pruned expired idempotency keys")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "idempotency sweep failed"),
        }
        tokio::time::sleep(sweep_interval).await;
    }
}

/// Periodically drops idempotency rows past their TTL. Runs as a separate
/// worker next to the API.
pub async fn init_expiry_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect_lazy_with(cfg.database.connection());
    expire_keys_loop(&pool, Duration::from_secs(cfg.idempotency.sweep_interval_secs)).await
}

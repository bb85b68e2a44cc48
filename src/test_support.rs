//! Shared fixtures for unit tests: a throwaway migrated database.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::configuration::DatabaseSettings;

/// Fresh migrated database in a temp dir. Keep the `TempDir` alive for
/// the duration of the test.
pub async fn test_pool() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let settings = DatabaseSettings {
        path: dir.path().join("pagw-test.db"),
        max_connections: 4,
        busy_timeout_ms: 5000,
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_with(settings.connection())
        .await
        .expect("failed to open test database");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("failed to migrate test database");
    (dir, pool)
}

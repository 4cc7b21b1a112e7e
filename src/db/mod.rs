//! SQLite persistence: rules, sync state, task records, settings.

mod repo;

pub use repo::*;

use crate::error::Result;

pub type Pool = sqlx::SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let pool = sqlx::SqlitePool::connect(database_url).await?;
    // Enable WAL so watch cycles and API readers don't block each other.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout=5000;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| crate::error::Error::Config(format!("migration failed: {e}")))?;
    Ok(())
}

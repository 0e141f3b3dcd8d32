#![forbid(unsafe_code)]

// Optional credential store - simulated users are upserted so the target
// server's authentication actually succeeds against a real account table

use crate::user::SimulatedUser;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn connect() -> anyhow::Result<Option<PgPool>> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            info!("DATABASE_URL not set — simulated credentials stay in memory");
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&url)
        .await?;

    info!("Connected to PostgreSQL");

    init_schema(&pool).await?;

    Ok(Some(pool))
}

async fn init_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS login (
            login TEXT PRIMARY KEY,
            password TEXT NOT NULL,
            email TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Create the simulated user's account, or refresh its password if it
/// already exists from an earlier run.
pub async fn ensure_user(pool: &PgPool, user: &SimulatedUser) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO login (login, password, email) VALUES ($1, $2, $3)
         ON CONFLICT (login) DO UPDATE SET password = EXCLUDED.password",
    )
    .bind(user.username())
    .bind(user.password_hash())
    .bind(user.email())
    .execute(pool)
    .await?;
    Ok(())
}

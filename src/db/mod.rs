pub mod meta;
pub mod products;
pub mod users;

use crate::{
    config::Config,
    constants::{DB_RETRY_BASE_MS, DB_RETRY_MAX_ATTEMPTS},
    error::{AppError, Result},
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::future::Future;
use std::time::Duration;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Retry an idempotent operation on transient store errors (serialization
/// failure, deadlock, pool timeout). Backoff 100ms, 200ms; three attempts.
/// Non-idempotent callers must not use this.
pub async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < DB_RETRY_MAX_ATTEMPTS => {
                let delay = Duration::from_millis(DB_RETRY_BASE_MS * 2u64.pow(attempt));
                tracing::warn!(
                    "Transient store error in {} (attempt {}): {}; retrying in {:?}",
                    op_name,
                    attempt + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn ensure_varchar_max(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.chars().count() > max_len {
        return Err(AppError::BadRequest(format!(
            "{} too long ({} > {})",
            field,
            value.chars().count(),
            max_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ensure_varchar_max_rejects_long_values() {
        assert!(ensure_varchar_max("users.username", &"x".repeat(65), 64).is_err());
        assert!(ensure_varchar_max("users.username", "ok", 64).is_ok());
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::BadRequest("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AppError::Database(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

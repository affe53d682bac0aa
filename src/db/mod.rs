use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

pub mod balances;
pub mod models;
pub mod requests;

pub use balances::BalanceChangeLedger;
pub use models::*;
pub use requests::RequestLedger;

/// Create a database connection pool
///
/// In-memory databases live per connection, so they are pinned to a single one.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .wrap_err("Invalid database URL")?
        .create_if_missing(true);

    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(10)
    };

    pool_options
        .connect_with(options)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Get the highest fully processed height of a ledger
pub async fn get_max_processed_height(pool: &SqlitePool, ledger: &str) -> Result<Option<u64>> {
    let row = sqlx::query("SELECT max_processed_height FROM watermarks WHERE ledger = ?1")
        .bind(ledger)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to get watermark for {}", ledger))?;

    row.map(|r| models::to_u64(r.get("max_processed_height"), "max_processed_height"))
        .transpose()
}

/// Record the highest fully processed height of a ledger
///
/// The stored value never moves backwards; a lower height is ignored.
pub async fn set_max_processed_height(pool: &SqlitePool, ledger: &str, height: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO watermarks (ledger, max_processed_height)
        VALUES (?1, ?2)
        ON CONFLICT (ledger) DO UPDATE SET
            max_processed_height = MAX(max_processed_height, excluded.max_processed_height),
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#,
    )
    .bind(ledger)
    .bind(models::to_i64(height, "max_processed_height")?)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update watermark for {} to {}", ledger, height))?;

    Ok(())
}

/// Look up a cached block timestamp
pub async fn get_block_timestamp(
    pool: &SqlitePool,
    network: &str,
    height: u64,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query("SELECT timestamp_ms FROM block_timestamps WHERE network = ?1 AND height = ?2")
        .bind(network)
        .bind(models::to_i64(height, "height")?)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to get {} block timestamp at {}", network, height))?;

    row.map(|r| {
        let ms: i64 = r.get("timestamp_ms");
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| eyre!("invalid cached timestamp {} for {} height {}", ms, network, height))
    })
    .transpose()
}

/// Cache a block timestamp; an existing entry is left untouched
pub async fn insert_block_timestamp(
    pool: &SqlitePool,
    network: &str,
    height: u64,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO block_timestamps (network, height, timestamp_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (network, height) DO NOTHING
        "#,
    )
    .bind(network)
    .bind(models::to_i64(height, "height")?)
    .bind(timestamp.timestamp_millis())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to cache {} block timestamp at {}", network, height))?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let pool = test_pool().await;

        assert_eq!(get_max_processed_height(&pool, "balances").await.unwrap(), None);

        set_max_processed_height(&pool, "balances", 120).await.unwrap();
        assert_eq!(get_max_processed_height(&pool, "balances").await.unwrap(), Some(120));

        set_max_processed_height(&pool, "balances", 90).await.unwrap();
        assert_eq!(get_max_processed_height(&pool, "balances").await.unwrap(), Some(120));

        set_max_processed_height(&pool, "balances", 121).await.unwrap();
        assert_eq!(get_max_processed_height(&pool, "balances").await.unwrap(), Some(121));
    }

    #[tokio::test]
    async fn test_watermarks_are_per_ledger() {
        let pool = test_pool().await;

        set_max_processed_height(&pool, "wrap_requests", 10).await.unwrap();
        set_max_processed_height(&pool, "unwrap_requests", 20).await.unwrap();

        assert_eq!(get_max_processed_height(&pool, "wrap_requests").await.unwrap(), Some(10));
        assert_eq!(get_max_processed_height(&pool, "unwrap_requests").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_block_timestamp_cache_keeps_first_value() {
        let pool = test_pool().await;
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();

        assert_eq!(get_block_timestamp(&pool, "nem", 5).await.unwrap(), None);

        insert_block_timestamp(&pool, "nem", 5, first).await.unwrap();
        insert_block_timestamp(&pool, "nem", 5, second).await.unwrap();

        assert_eq!(get_block_timestamp(&pool, "nem", 5).await.unwrap(), Some(first));
        assert_eq!(get_block_timestamp(&pool, "ethereum", 5).await.unwrap(), None);
    }
}

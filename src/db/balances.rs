//! Native balance index of the bridge account

use eyre::{eyre, Result, WrapErr};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::models::to_i64;

const LEDGER_NAME: &str = "native_balances";

/// Per-height balance deltas of the bridge account on the native chain
#[derive(Debug, Clone)]
pub struct BalanceChangeLedger {
    pool: SqlitePool,
}

impl BalanceChangeLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn ledger_name(&self) -> &'static str {
        LEDGER_NAME
    }

    /// Store the balance delta of `height`; re-downloading a height is a no-op
    pub async fn add_balance_change(&self, height: u64, amount: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_changes (height, amount) VALUES (?1, ?2)
            ON CONFLICT (height) DO NOTHING
            "#,
        )
        .bind(to_i64(height, "height")?)
        .bind(amount)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to insert balance change at {}", height))?;

        Ok(())
    }

    /// Bridge balance after applying every block up to and including `height`
    pub async fn balance_at(&self, height: u64) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS balance FROM balance_changes WHERE height <= ?1",
        )
        .bind(to_i64(height, "height")?)
        .fetch_one(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to compute balance at {}", height))?;

        let balance: i64 = row.get("balance");
        u64::try_from(balance)
            .map_err(|_| eyre!("bridge balance at height {} is negative ({})", height, balance))
    }

    pub async fn max_processed_height(&self) -> Result<Option<u64>> {
        super::get_max_processed_height(&self.pool, LEDGER_NAME).await
    }

    pub async fn set_max_processed_height(&self, height: u64) -> Result<()> {
        super::set_max_processed_height(&self.pool, LEDGER_NAME, height).await
    }
}

use chrono::{DateTime, Utc};
use eyre::Result;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

use super::ChainConnector;
use crate::db;

/// Read-through cache of block timestamps for one network
#[derive(Clone)]
pub struct BlockTimestamps {
    pool: SqlitePool,
    network: String,
    connector: Arc<dyn ChainConnector>,
}

impl BlockTimestamps {
    pub fn new(pool: SqlitePool, network: impl Into<String>, connector: Arc<dyn ChainConnector>) -> Self {
        Self {
            pool,
            network: network.into(),
            connector,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Timestamp of the block at `height`, asking the node on a cache miss
    pub async fn timestamp(&self, height: u64) -> Result<DateTime<Utc>> {
        if let Some(cached) = db::get_block_timestamp(&self.pool, &self.network, height).await? {
            return Ok(cached);
        }

        let timestamp = self.connector.block_timestamp(height).await?;
        db::insert_block_timestamp(&self.pool, &self.network, height, timestamp).await?;
        Ok(timestamp)
    }
}

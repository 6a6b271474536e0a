//! PostgreSQL state manager

use super::SettlementStore;
use crate::config::DatabaseConfig;
use crate::error::SettlementResult;
use crate::htlc::HtlcContract;
use crate::intent::IntentRecord;
use crate::swap::AtomicSwap;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> SettlementResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SettlementResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intents (
                intent_id VARCHAR(66) PRIMARY KEY,
                signer VARCHAR(42) NOT NULL,
                status VARCHAR(20) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intent_nonces (
                signer VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                intent_id VARCHAR(66) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (signer, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                swap_id UUID PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                settled BOOLEAN NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_unsettled
            ON swaps (created_at) WHERE NOT settled
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS htlc_contracts (
                chain_id BIGINT NOT NULL,
                lock_id VARCHAR(66) NOT NULL,
                state VARCHAR(20) NOT NULL,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, lock_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn key(hash: H256) -> String {
    format!("0x{}", hex::encode(hash))
}

fn account(address: Address) -> String {
    format!("0x{}", hex::encode(address))
}

#[async_trait]
impl SettlementStore for StateManager {
    async fn put_intent(&self, record: &IntentRecord) -> SettlementResult<()> {
        let data = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            INSERT INTO intents (intent_id, signer, status, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (intent_id)
            DO UPDATE SET status = $3, record = $4, updated_at = NOW()
            "#,
        )
        .bind(key(record.intent.id))
        .bind(account(record.intent.params.signer))
        .bind(record.status.as_str())
        .bind(data)
        .execute(&self.pool)
        .await?;

        debug!("Stored intent {:?} ({})", record.intent.id, record.status);
        Ok(())
    }

    async fn get_intent(&self, intent_id: H256) -> SettlementResult<Option<IntentRecord>> {
        let row = sqlx::query("SELECT record FROM intents WHERE intent_id = $1")
            .bind(key(intent_id))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| serde_json::from_value(r.get("record")))
            .transpose()
            .map_err(Into::into)
    }

    async fn delete_intent(&self, intent_id: H256) -> SettlementResult<()> {
        sqlx::query("DELETE FROM intents WHERE intent_id = $1")
            .bind(key(intent_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reserve_nonce(
        &self,
        signer: Address,
        nonce: u64,
        intent_id: H256,
    ) -> SettlementResult<bool> {
        // u64 -> i64 is a bijection, so uniqueness carries over
        let result = sqlx::query(
            r#"
            INSERT INTO intent_nonces (signer, nonce, intent_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (signer, nonce) DO NOTHING
            "#,
        )
        .bind(account(signer))
        .bind(nonce as i64)
        .bind(key(intent_id))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_nonce(&self, signer: Address, nonce: u64) -> SettlementResult<()> {
        sqlx::query("DELETE FROM intent_nonces WHERE signer = $1 AND nonce = $2")
            .bind(account(signer))
            .bind(nonce as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_swap(&self, swap: &AtomicSwap) -> SettlementResult<()> {
        let data = serde_json::to_value(swap)?;

        sqlx::query(
            r#"
            INSERT INTO swaps (swap_id, status, settled, record, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (swap_id)
            DO UPDATE SET status = $2, settled = $3, record = $4, updated_at = NOW()
            "#,
        )
        .bind(swap.id)
        .bind(swap.status.as_str())
        .bind(swap.is_settled())
        .bind(data)
        .bind(swap.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Stored swap {} ({})", swap.id, swap.status);
        Ok(())
    }

    async fn get_swap(&self, swap_id: Uuid) -> SettlementResult<Option<AtomicSwap>> {
        let row = sqlx::query("SELECT record FROM swaps WHERE swap_id = $1")
            .bind(swap_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| serde_json::from_value(r.get("record")))
            .transpose()
            .map_err(Into::into)
    }

    async fn list_unsettled_swaps(&self) -> SettlementResult<Vec<AtomicSwap>> {
        let rows = sqlx::query(
            "SELECT record FROM swaps WHERE NOT settled ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| serde_json::from_value(r.get("record")).map_err(Into::into))
            .collect()
    }

    async fn put_htlc(&self, contract: &HtlcContract) -> SettlementResult<()> {
        let data = serde_json::to_value(contract)?;

        sqlx::query(
            r#"
            INSERT INTO htlc_contracts (chain_id, lock_id, state, record)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain_id, lock_id)
            DO UPDATE SET state = $3, record = $4, updated_at = NOW()
            "#,
        )
        .bind(contract.chain_id as i64)
        .bind(key(contract.lock_id))
        .bind(contract.state.as_str())
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_htlc(
        &self,
        chain_id: u64,
        lock_id: H256,
    ) -> SettlementResult<Option<HtlcContract>> {
        let row = sqlx::query(
            "SELECT record FROM htlc_contracts WHERE chain_id = $1 AND lock_id = $2",
        )
        .bind(chain_id as i64)
        .bind(key(lock_id))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| serde_json::from_value(r.get("record")))
            .transpose()
            .map_err(Into::into)
    }

    /// Health check
    async fn health_check(&self) -> SettlementResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

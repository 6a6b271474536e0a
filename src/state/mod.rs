//! Settlement state persistence
//!
//! Handles:
//! - Intent records with their proposals
//! - Used `(signer, nonce)` pairs, kept after an intent is cancelled
//! - Swap records, including the unsettled set scanned by recovery
//! - HTLC records keyed by chain and lock id
//!
//! Chain data stays authoritative; these records are the engine's view of it.

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::MemoryStore;

use crate::error::SettlementResult;
use crate::htlc::HtlcContract;
use crate::intent::IntentRecord;
use crate::swap::AtomicSwap;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use uuid::Uuid;

/// Repository for intent, swap and HTLC records
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn put_intent(&self, record: &IntentRecord) -> SettlementResult<()>;

    async fn get_intent(&self, intent_id: H256) -> SettlementResult<Option<IntentRecord>>;

    async fn delete_intent(&self, intent_id: H256) -> SettlementResult<()>;

    /// Claim a signer's nonce for `intent_id`; `false` if it was ever claimed
    async fn reserve_nonce(
        &self,
        signer: Address,
        nonce: u64,
        intent_id: H256,
    ) -> SettlementResult<bool>;

    /// Undo a reservation whose intent was never stored
    async fn release_nonce(&self, signer: Address, nonce: u64) -> SettlementResult<()>;

    async fn put_swap(&self, swap: &AtomicSwap) -> SettlementResult<()>;

    async fn get_swap(&self, swap_id: Uuid) -> SettlementResult<Option<AtomicSwap>>;

    /// Swaps with a non-terminal status or a leg that still holds funds
    async fn list_unsettled_swaps(&self) -> SettlementResult<Vec<AtomicSwap>>;

    async fn put_htlc(&self, contract: &HtlcContract) -> SettlementResult<()>;

    async fn get_htlc(&self, chain_id: u64, lock_id: H256)
        -> SettlementResult<Option<HtlcContract>>;

    async fn health_check(&self) -> SettlementResult<()>;
}

//! In-process store used by tests and `--simulate`

use super::SettlementStore;
use crate::error::SettlementResult;
use crate::htlc::HtlcContract;
use crate::intent::IntentRecord;
use crate::swap::AtomicSwap;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    intents: DashMap<H256, IntentRecord>,
    nonces: DashMap<(Address, u64), H256>,
    swaps: DashMap<Uuid, AtomicSwap>,
    htlcs: DashMap<(u64, H256), HtlcContract>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn put_intent(&self, record: &IntentRecord) -> SettlementResult<()> {
        self.intents.insert(record.intent.id, record.clone());
        Ok(())
    }

    async fn get_intent(&self, intent_id: H256) -> SettlementResult<Option<IntentRecord>> {
        Ok(self.intents.get(&intent_id).map(|r| r.clone()))
    }

    async fn delete_intent(&self, intent_id: H256) -> SettlementResult<()> {
        self.intents.remove(&intent_id);
        Ok(())
    }

    async fn reserve_nonce(
        &self,
        signer: Address,
        nonce: u64,
        intent_id: H256,
    ) -> SettlementResult<bool> {
        match self.nonces.entry((signer, nonce)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(intent_id);
                Ok(true)
            }
        }
    }

    async fn release_nonce(&self, signer: Address, nonce: u64) -> SettlementResult<()> {
        self.nonces.remove(&(signer, nonce));
        Ok(())
    }

    async fn put_swap(&self, swap: &AtomicSwap) -> SettlementResult<()> {
        self.swaps.insert(swap.id, swap.clone());
        Ok(())
    }

    async fn get_swap(&self, swap_id: Uuid) -> SettlementResult<Option<AtomicSwap>> {
        Ok(self.swaps.get(&swap_id).map(|s| s.clone()))
    }

    async fn list_unsettled_swaps(&self) -> SettlementResult<Vec<AtomicSwap>> {
        let mut swaps: Vec<AtomicSwap> = self
            .swaps
            .iter()
            .filter(|entry| !entry.value().is_settled())
            .map(|entry| entry.value().clone())
            .collect();
        swaps.sort_by_key(|s| s.created_at);
        Ok(swaps)
    }

    async fn put_htlc(&self, contract: &HtlcContract) -> SettlementResult<()> {
        self.htlcs
            .insert((contract.chain_id, contract.lock_id), contract.clone());
        Ok(())
    }

    async fn get_htlc(
        &self,
        chain_id: u64,
        lock_id: H256,
    ) -> SettlementResult<Option<HtlcContract>> {
        Ok(self.htlcs.get(&(chain_id, lock_id)).map(|c| c.clone()))
    }

    async fn health_check(&self) -> SettlementResult<()> {
        Ok(())
    }
}

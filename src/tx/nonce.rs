//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent escrow calls never collide
//! - Nonce gap detection and recovery

use crate::chain::ChainProvider;
use crate::error::{SettlementError, SettlementResult};

use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Nonce state for one signing account on one chain
#[derive(Debug, Default)]
struct NonceState {
    /// Current local nonce (next to use)
    current: u64,
    /// Pending transactions: nonce -> tx_hash
    pending: HashMap<u64, String>,
    /// Last confirmed nonce
    confirmed: Option<u64>,
}

/// Manages nonces of the engine wallet on one chain
pub struct NonceManager {
    chain_id: u64,
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    /// Create a manager starting at `start`
    pub fn new(chain_id: u64, wallet_address: Address, start: u64) -> Self {
        Self {
            chain_id,
            wallet_address,
            state: Mutex::new(NonceState {
                current: start,
                pending: HashMap::new(),
                confirmed: start.checked_sub(1),
            }),
        }
    }

    /// Create a manager seeded from the account's on-chain nonce
    pub async fn from_chain(
        wallet_address: Address,
        provider: &ChainProvider,
    ) -> SettlementResult<Self> {
        let on_chain = provider.get_transaction_count(wallet_address).await?;
        let manager = Self::new(provider.chain_id(), wallet_address, on_chain.as_u64());
        debug!(
            "Initialized nonce for {:?} on chain {}: {}",
            wallet_address,
            provider.chain_id(),
            on_chain
        );
        Ok(manager)
    }

    /// Allocate the next nonce
    pub async fn next_nonce(&self) -> u64 {
        let mut state = self.state.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, self.chain_id);
        nonce
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        let mut state = self.state.lock().await;
        state.pending.insert(nonce, tx_hash.to_string());
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm_nonce(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
    }

    /// Confirm the nonce carrying `tx_hash`, if it is still pending
    pub async fn confirm_tx(&self, tx_hash: &str) {
        let nonce = {
            let state = self.state.lock().await;
            state
                .pending
                .iter()
                .find(|(_, hash)| hash.as_str() == tx_hash)
                .map(|(nonce, _)| *nonce)
        };
        if let Some(nonce) = nonce {
            self.confirm_nonce(nonce).await;
        }
    }

    /// Release a nonce whose transaction never reached the node
    pub async fn release_nonce(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if nonce + 1 == state.current {
            state.current = nonce;
        }
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> SettlementResult<()> {
        let on_chain = provider
            .get_transaction_count(self.wallet_address)
            .await
            .map_err(|e| {
                SettlementError::submission(self.chain_id, format!("nonce sync failed: {}", e))
            })?
            .as_u64();
        self.apply_on_chain(on_chain).await;
        Ok(())
    }

    async fn apply_on_chain(&self, on_chain: u64) {
        let mut state = self.state.lock().await;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain > expected {
            warn!(
                "Nonce gap detected on chain {}: expected {}, got {}",
                self.chain_id, expected, on_chain
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain);
        state.confirmed = on_chain.checked_sub(1);

        if state.current < on_chain {
            state.current = on_chain;
        }
    }

    /// Get pending count
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_allocation() {
        let manager = NonceManager::new(1, Address::zero(), 5);
        assert_eq!(manager.next_nonce().await, 5);
        assert_eq!(manager.next_nonce().await, 6);
    }

    #[tokio::test]
    async fn test_release_last_nonce_is_reused() {
        let manager = NonceManager::new(1, Address::zero(), 0);
        let first = manager.next_nonce().await;
        let second = manager.next_nonce().await;
        manager.release_nonce(first).await;
        // not the latest allocation, stays burned
        assert_eq!(manager.next_nonce().await, 2);
        manager.release_nonce(2).await;
        assert_eq!(manager.next_nonce().await, 2);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_sync_clears_mined_pending() {
        let manager = NonceManager::new(1, Address::zero(), 0);
        for n in 0..3 {
            let nonce = manager.next_nonce().await;
            manager.mark_pending(nonce, &format!("0x{:02x}", n)).await;
        }
        assert_eq!(manager.pending_count().await, 3);

        manager.apply_on_chain(2).await;
        assert_eq!(manager.pending_count().await, 1);

        manager.confirm_tx("0x02").await;
        assert_eq!(manager.pending_count().await, 0);

        manager.apply_on_chain(10).await;
        assert_eq!(manager.next_nonce().await, 10);
    }
}

//! Confirmation tracking for escrow transactions
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: soft finality from the sequencer
//! - Avalanche: Instant finality (1 block)

use crate::chain::ChainProvider;
use crate::error::{SettlementError, SettlementResult};

use ethers::types::{TransactionReceipt, H256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Waits for escrow transactions to reach a confirmation depth
pub struct FinalityTracker {
    chain_id: u64,
    /// Floor applied to every wait, from chain config
    confirmation_blocks: u64,
    provider: Arc<ChainProvider>,
    poll_interval: Duration,
    timeout: Duration,
    /// Inclusion block first observed per tx, for reorg detection
    pending: RwLock<HashMap<H256, u64>>,
}

impl FinalityTracker {
    pub fn new(
        chain_id: u64,
        confirmation_blocks: u64,
        provider: Arc<ChainProvider>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            chain_id,
            confirmation_blocks,
            provider,
            poll_interval,
            timeout,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Confirmation depth actually enforced for a caller's request
    pub fn required_confirmations(&self, min_confirmations: u64) -> u64 {
        min_confirmations.max(self.confirmation_blocks).max(1)
    }

    /// Current confirmation count, or `None` while the tx is not mined
    pub async fn confirmations(
        &self,
        tx_hash: H256,
    ) -> SettlementResult<Option<(TransactionReceipt, u64)>> {
        let receipt = match self.provider.get_transaction_receipt(tx_hash).await? {
            Some(receipt) => receipt,
            None => {
                if let Some(block) = self.pending.write().await.remove(&tx_hash) {
                    // Seen mined before, gone now
                    warn!(
                        "Reorg detected: tx {:?} no longer included on chain {} (was block {})",
                        tx_hash, self.chain_id, block
                    );
                    return Err(SettlementError::submission(
                        self.chain_id,
                        format!("transaction {:?} dropped by reorg", tx_hash),
                    ));
                }
                return Ok(None);
            }
        };

        let Some(tx_block) = receipt.block_number.map(|b| b.as_u64()) else {
            return Ok(None);
        };

        let previous = self.pending.write().await.insert(tx_hash, tx_block);
        if let Some(previous) = previous {
            if previous != tx_block {
                debug!(
                    "Tx {:?} moved from block {} to {} on chain {}",
                    tx_hash, previous, tx_block, self.chain_id
                );
            }
        }

        let current_block = self.provider.get_block_number().await?;
        // The inclusion block counts as the first confirmation
        let confirmations = current_block.saturating_sub(tx_block) + 1;
        Ok(Some((receipt, confirmations)))
    }

    /// Poll until `tx_hash` has the required depth or the timeout elapses
    pub async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        min_confirmations: u64,
    ) -> SettlementResult<TransactionReceipt> {
        let required = self.required_confirmations(min_confirmations);
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            if let Some((receipt, confirmations)) = self.confirmations(tx_hash).await? {
                if confirmations >= required {
                    self.pending.write().await.remove(&tx_hash);
                    info!(
                        "Transaction {:?} confirmed on chain {} ({} confirmations)",
                        tx_hash, self.chain_id, confirmations
                    );
                    return Ok(receipt);
                }
                debug!(
                    "Transaction {:?} has {} / {} confirmations on chain {}",
                    tx_hash, confirmations, required, self.chain_id
                );
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SettlementError::Timeout {
                    operation: format!(
                        "{} confirmations of {:?} on chain {}",
                        required, tx_hash, self.chain_id
                    ),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Get pending transaction count
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local devnets
        31337 | 1337 => 1,
        // Default conservative
        _ => 64,
    }
}

//! `ChainClient` backed by an EVM JSON-RPC node

use super::escrow::{self, EscrowCall, OnChainContract};
use super::{ChainClient, ChainProvider, FinalityTracker, TxReceipt};
use crate::error::{SettlementError, SettlementResult};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, H256, U64};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signs each escrow call with the key of the account the escrow expects as
/// `msg.sender`: the lock sender for `newContract` and `refund`, the
/// receiver for `withdraw`.
pub struct EvmChainClient {
    provider: Arc<ChainProvider>,
    escrow: Address,
    senders: HashMap<Address, TransactionSender>,
    finality: FinalityTracker,
}

impl EvmChainClient {
    pub fn new(
        provider: Arc<ChainProvider>,
        escrow: Address,
        senders: Vec<TransactionSender>,
        finality: FinalityTracker,
    ) -> Self {
        let senders: HashMap<Address, TransactionSender> = senders
            .into_iter()
            .map(|sender| (sender.wallet_address(), sender))
            .collect();
        info!(
            "Chain {} signs for {} accounts",
            provider.chain_id(),
            senders.len()
        );
        Self {
            provider,
            escrow,
            senders,
            finality,
        }
    }

    fn escrow(&self) -> Address {
        self.escrow
    }

    /// Accounts this client holds signing keys for
    pub fn signers(&self) -> Vec<Address> {
        self.senders.keys().copied().collect()
    }

    fn to_receipt(&self, receipt: &TransactionReceipt) -> TxReceipt {
        TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            success: receipt.status == Some(U64::one()),
            contract_id: escrow::contract_id_from_logs(&receipt.logs, self.escrow()),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    async fn submit_transaction(
        &self,
        from: Address,
        call: &EscrowCall,
    ) -> SettlementResult<TxReceipt> {
        let sender = self.senders.get(&from).ok_or_else(|| {
            SettlementError::Wallet(format!(
                "no signing key for {:?} on chain {}",
                from,
                self.chain_id()
            ))
        })?;

        let tx_hash = sender.send(call).await?;
        crate::metrics::record_tx_submitted(self.chain_id(), call.name());

        Ok(TxReceipt {
            tx_hash,
            block_number: None,
            success: true,
            contract_id: None,
        })
    }

    async fn get_block_timestamp(&self) -> SettlementResult<u64> {
        self.provider.get_block_timestamp().await
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        min_confirmations: u64,
    ) -> SettlementResult<TxReceipt> {
        let receipt = self
            .finality
            .wait_for_confirmation(tx_hash, min_confirmations)
            .await?;
        for sender in self.senders.values() {
            sender.confirm(tx_hash).await;
        }

        let receipt = self.to_receipt(&receipt);
        if !receipt.success {
            warn!(
                "Transaction {:?} reverted on chain {}",
                tx_hash,
                self.chain_id()
            );
        }
        Ok(receipt)
    }

    async fn get_contract(&self, contract_id: H256) -> SettlementResult<OnChainContract> {
        let output = self
            .provider
            .call(self.escrow(), escrow::encode_get_contract(contract_id))
            .await?;
        let contract = escrow::decode_get_contract(&output)?;
        debug!(
            "getContract({:?}) on chain {}: exists={}",
            contract_id,
            self.chain_id(),
            contract.exists()
        );
        Ok(contract)
    }
}

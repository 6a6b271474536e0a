//! Chain module - per-chain access to the HTLC escrow contract
//!
//! This module provides:
//! - The `ChainClient` boundary the settlement engine is written against
//! - An ethers-based EVM client with multi-RPC failover and confirmation tracking
//! - An in-memory escrow chain for tests and dry runs
//! - A retry decorator with bounded exponential backoff

pub mod escrow;
pub mod evm;
pub mod finality;
pub mod provider;
pub mod retry;
pub mod simulated;

pub use escrow::{EscrowCall, OnChainContract};
pub use evm::EvmChainClient;
pub use finality::FinalityTracker;
pub use provider::{ChainProvider, GasPrice};
pub use retry::{retry_with_backoff, RetryPolicy, RetryingClient};
pub use simulated::SimulatedChain;

use crate::error::SettlementResult;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a submitted escrow transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    /// `None` while the transaction is still pending
    pub block_number: Option<u64>,
    pub success: bool,
    /// Contract id emitted by `newContract`, when the receipt carries it
    pub contract_id: Option<H256>,
}

/// Access to one chain's escrow contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain this client talks to
    fn chain_id(&self) -> u64;

    /// Sign and broadcast an escrow call as `from`, the escrow's `msg.sender`
    async fn submit_transaction(
        &self,
        from: Address,
        call: &EscrowCall,
    ) -> SettlementResult<TxReceipt>;

    /// Timestamp of the latest block; the authoritative clock for timelocks
    async fn get_block_timestamp(&self) -> SettlementResult<u64>;

    /// Block until `tx_hash` has at least `min_confirmations` confirmations
    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        min_confirmations: u64,
    ) -> SettlementResult<TxReceipt>;

    /// Read `getContract(contractId)`; a missing contract has a zero sender
    async fn get_contract(&self, contract_id: H256) -> SettlementResult<OnChainContract>;
}

#[async_trait]
impl<C: ChainClient + ?Sized> ChainClient for Arc<C> {
    fn chain_id(&self) -> u64 {
        (**self).chain_id()
    }

    async fn submit_transaction(
        &self,
        from: Address,
        call: &EscrowCall,
    ) -> SettlementResult<TxReceipt> {
        (**self).submit_transaction(from, call).await
    }

    async fn get_block_timestamp(&self) -> SettlementResult<u64> {
        (**self).get_block_timestamp().await
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        min_confirmations: u64,
    ) -> SettlementResult<TxReceipt> {
        (**self).wait_for_confirmation(tx_hash, min_confirmations).await
    }

    async fn get_contract(&self, contract_id: H256) -> SettlementResult<OnChainContract> {
        (**self).get_contract(contract_id).await
    }
}

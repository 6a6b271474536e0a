//! Bounded exponential backoff for chain access
//!
//! Only failures classified retryable by `SettlementError::is_retryable` are
//! retried. Reverts and validation errors surface immediately.

use super::{ChainClient, EscrowCall, OnChainContract, TxReceipt};
use crate::config::RetryConfig;
use crate::error::SettlementResult;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
) -> SettlementResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SettlementResult<T>>,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                retry += 1;
                warn!(
                    "{} failed (retry {}/{} in {:?}): {}",
                    name, retry, policy.max_retries, delay, e
                );
                crate::metrics::record_retry(name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `ChainClient` decorator applying `retry_with_backoff` to every call
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ChainClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ChainClient> ChainClient for RetryingClient<C> {
    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    async fn submit_transaction(
        &self,
        from: Address,
        call: &EscrowCall,
    ) -> SettlementResult<TxReceipt> {
        // A repeated newContract with identical fields reverts on the duplicate
        // contract id, so resubmitting cannot double-lock funds.
        let inner = &self.inner;
        retry_with_backoff(&self.policy, call.name(), move || {
            inner.submit_transaction(from, call)
        })
        .await
    }

    async fn get_block_timestamp(&self) -> SettlementResult<u64> {
        let inner = &self.inner;
        retry_with_backoff(&self.policy, "get_block_timestamp", move || {
            inner.get_block_timestamp()
        })
        .await
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        min_confirmations: u64,
    ) -> SettlementResult<TxReceipt> {
        let inner = &self.inner;
        retry_with_backoff(&self.policy, "wait_for_confirmation", move || {
            inner.wait_for_confirmation(tx_hash, min_confirmations)
        })
        .await
    }

    async fn get_contract(&self, contract_id: H256) -> SettlementResult<OnChainContract> {
        let inner = &self.inner;
        retry_with_backoff(&self.policy, "get_contract", move || {
            inner.get_contract(contract_id)
        })
        .await
    }
}

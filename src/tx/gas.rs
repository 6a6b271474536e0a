//! Gas estimation for escrow calls

use crate::chain::{ChainProvider, EscrowCall, GasPrice};
use crate::error::SettlementResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::{debug, warn};

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Upper bound used when the node cannot estimate
    pub fn default_gas_limit(call: &EscrowCall) -> U256 {
        match call {
            // token transferFrom + storage of the contract struct
            EscrowCall::NewContract { .. } => U256::from(250_000),
            EscrowCall::Withdraw { .. } => U256::from(120_000),
            EscrowCall::Refund { .. } => U256::from(100_000),
        }
    }

    /// Estimate the gas limit for an escrow call, buffered
    pub async fn estimate_gas_limit(
        &self,
        provider: &ChainProvider,
        call: &EscrowCall,
        tx: &TypedTransaction,
    ) -> SettlementResult<U256> {
        match provider.estimate_gas(tx).await {
            Ok(estimate) => Ok(self.buffer_limit(estimate)),
            // A revert during estimation means the call itself is illegal now
            Err(e) if !e.is_retryable() => Err(e),
            Err(e) => {
                warn!(
                    "Gas estimation failed for {} on chain {}: {}; using default",
                    call.name(),
                    provider.chain_id(),
                    e
                );
                Ok(Self::default_gas_limit(call))
            }
        }
    }

    fn buffer_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get optimized gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> SettlementResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price);

        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

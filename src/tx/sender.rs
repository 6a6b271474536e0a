//! Transaction sender for escrow calls
//!
//! One attempt per call. Retrying is the caller's decision, made on the
//! error classification returned here.

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, EscrowCall, GasPrice};
use crate::config::WalletConfig;
use crate::error::{SettlementError, SettlementResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

const DEFAULT_KEY_ENV: &str = "SETTLEMENT_PRIVATE_KEY";

/// Signs and broadcasts escrow calls on one chain
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    wallet: LocalWallet,
    escrow: Address,
    send_timeout: Duration,
}

impl TransactionSender {
    /// Create a sender for `provider`'s chain, seeding the nonce from chain
    pub async fn new(
        provider: Arc<ChainProvider>,
        wallet: LocalWallet,
        escrow: Address,
    ) -> SettlementResult<Self> {
        let wallet = wallet.with_chain_id(provider.chain_id());
        let nonce_manager = NonceManager::from_chain(wallet.address(), &provider).await?;

        info!(
            "Transaction sender for chain {} initialized with wallet: {:?}",
            provider.chain_id(),
            wallet.address()
        );

        Ok(Self {
            provider,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            escrow,
            send_timeout: Duration::from_secs(30),
        })
    }

    /// Load the signing key from the configured environment variable
    pub fn load_wallet(config: &WalletConfig) -> SettlementResult<LocalWallet> {
        let var = config.private_key_env.as_deref().unwrap_or(DEFAULT_KEY_ENV);
        let key = std::env::var(var).map_err(|_| {
            SettlementError::Wallet(format!("No wallet configured. Set {}", var))
        })?;
        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| SettlementError::Wallet(format!("Invalid private key: {}", e)))
    }

    /// Engine key followed by every configured party key, without duplicates
    pub fn load_wallets(config: &WalletConfig) -> SettlementResult<Vec<LocalWallet>> {
        let mut wallets = vec![Self::load_wallet(config)?];
        for var in &config.party_key_envs {
            let key = std::env::var(var).map_err(|_| {
                SettlementError::Wallet(format!("Party key {} is not set", var))
            })?;
            let wallet = key
                .trim()
                .parse::<LocalWallet>()
                .map_err(|e| SettlementError::Wallet(format!("Invalid key in {}: {}", var, e)))?;
            if wallets.iter().all(|w| w.address() != wallet.address()) {
                wallets.push(wallet);
            }
        }
        Ok(wallets)
    }

    /// Sign and broadcast one escrow call
    pub async fn send(&self, call: &EscrowCall) -> SettlementResult<H256> {
        let chain_id = self.provider.chain_id();
        let data = call.encode();

        let draft: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.escrow)
            .data(data.clone())
            .into();
        let gas_limit = self
            .gas_estimator
            .estimate_gas_limit(&self.provider, call, &draft)
            .await?;
        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;

        let nonce = self.nonce_manager.next_nonce().await;
        let tx = self.build_tx(data, nonce, gas_limit, &gas_price);

        let signature = match self.wallet.sign_transaction(&tx).await {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to sign transaction: {}", e);
                self.nonce_manager.release_nonce(nonce).await;
                return Err(SettlementError::Wallet(e.to_string()));
            }
        };
        let raw = tx.rlp_signed(&signature);

        match timeout(self.send_timeout, self.provider.send_raw_transaction(raw)).await {
            Ok(Ok(tx_hash)) => {
                self.nonce_manager
                    .mark_pending(nonce, &format!("{:?}", tx_hash))
                    .await;
                info!(
                    "Transaction sent: {} {:?} on chain {} (nonce {})",
                    call.name(),
                    tx_hash,
                    chain_id,
                    nonce
                );
                Ok(tx_hash)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.nonce_manager.release_nonce(nonce).await;

                if message.contains("nonce too low") {
                    warn!("Nonce too low on chain {}, syncing", chain_id);
                    self.nonce_manager.sync(&self.provider).await?;
                    Err(SettlementError::submission(chain_id, message))
                } else if message.contains("insufficient funds") {
                    Err(SettlementError::Wallet(format!(
                        "insufficient funds on chain {}",
                        chain_id
                    )))
                } else {
                    Err(e)
                }
            }
            Err(_) => {
                // The node may still have accepted it; keep the nonce allocated
                warn!("Transaction send timeout on chain {} (nonce {})", chain_id, nonce);
                Err(SettlementError::Timeout {
                    operation: format!("send {} on chain {}", call.name(), chain_id),
                })
            }
        }
    }

    /// Record that `tx_hash` was mined
    pub async fn confirm(&self, tx_hash: H256) {
        self.nonce_manager
            .confirm_tx(&format!("{:?}", tx_hash))
            .await;
    }

    fn build_tx(
        &self,
        data: Bytes,
        nonce: u64,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(self.escrow)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .chain_id(self.provider.chain_id()),
            ),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(self.escrow)
                    .data(data)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(self.provider.chain_id()),
            ),
        }
    }

    /// Get wallet balance
    pub async fn get_balance(&self) -> SettlementResult<U256> {
        self.provider
            .http()
            .get_balance(self.wallet.address(), None)
            .await
            .map_err(|e| SettlementError::submission(self.provider.chain_id(), e.to_string()))
    }

    /// Get wallet address
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Escrow contract this sender targets
    pub fn escrow(&self) -> Address {
        self.escrow
    }

    /// Pending transactions not yet confirmed
    pub async fn pending_count(&self) -> usize {
        self.nonce_manager.pending_count().await
    }
}

//! In-memory escrow chain
//!
//! Applies the same rules as the deployed hash time-locked escrow: funds move
//! into the contract on `newContract`, out to the receiver on a matching
//! `withdraw` before the timelock, and back to the sender on `refund` once the
//! timelock has passed. Block time only moves when a test or operator moves it.

use super::{ChainClient, EscrowCall, OnChainContract, TxReceipt};
use crate::error::{SettlementError, SettlementResult};
use crate::hashlock::{self, HashAlgorithm, Secret};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct Ledger {
    timestamp: u64,
    block_number: u64,
    tx_count: u64,
    /// (token, owner) -> balance
    balances: HashMap<(Address, Address), U256>,
    contracts: HashMap<H256, OnChainContract>,
    receipts: HashMap<H256, TxReceipt>,
    /// Submissions rejected before reaching the ledger
    fail_next: u32,
    /// Submissions applied to the ledger whose response is then lost
    land_then_fail: u32,
}

impl Ledger {
    fn balance(&self, token: Address, owner: Address) -> U256 {
        self.balances
            .get(&(token, owner))
            .copied()
            .unwrap_or_default()
    }

    fn transfer(&mut self, token: Address, from: Address, to: Address, amount: U256) -> bool {
        let available = self.balance(token, from);
        if available < amount {
            return false;
        }
        self.balances.insert((token, from), available - amount);
        let credited = self.balance(token, to) + amount;
        self.balances.insert((token, to), credited);
        true
    }
}

/// Single-chain escrow ledger kept in memory
pub struct SimulatedChain {
    chain_id: u64,
    algorithm: HashAlgorithm,
    escrow: Address,
    ledger: Mutex<Ledger>,
}

impl SimulatedChain {
    pub fn new(chain_id: u64, algorithm: HashAlgorithm, start_time: u64) -> Self {
        let escrow = Address::from_low_u64_be(0xe5c0_0000 + chain_id);
        Self {
            chain_id,
            algorithm,
            escrow,
            ledger: Mutex::new(Ledger {
                timestamp: start_time,
                block_number: 1,
                ..Default::default()
            }),
        }
    }

    /// Address holding locked funds
    pub fn escrow_address(&self) -> Address {
        self.escrow
    }

    /// Credit `amount` of `token` to `owner`
    pub async fn mint(&self, token: Address, owner: Address, amount: U256) {
        let mut ledger = self.ledger.lock().await;
        let balance = ledger.balance(token, owner) + amount;
        ledger.balances.insert((token, owner), balance);
    }

    pub async fn balance_of(&self, token: Address, owner: Address) -> U256 {
        self.ledger.lock().await.balance(token, owner)
    }

    pub async fn now(&self) -> u64 {
        self.ledger.lock().await.timestamp
    }

    pub async fn set_time(&self, timestamp: u64) {
        let mut ledger = self.ledger.lock().await;
        ledger.timestamp = timestamp;
        ledger.block_number += 1;
    }

    pub async fn advance_time(&self, secs: u64) {
        let mut ledger = self.ledger.lock().await;
        ledger.timestamp += secs;
        ledger.block_number += 1;
    }

    /// Reject the next `count` submissions with a transient RPC error
    pub async fn fail_next_submissions(&self, count: u32) {
        self.ledger.lock().await.fail_next = count;
    }

    /// Apply the next `count` submissions but report a transient error
    pub async fn land_then_fail_next(&self, count: u32) {
        self.ledger.lock().await.land_then_fail = count;
    }

    pub async fn contract(&self, contract_id: H256) -> Option<OnChainContract> {
        self.ledger.lock().await.contracts.get(&contract_id).cloned()
    }

    /// Number of transactions applied, reverted ones included
    pub async fn transaction_count(&self) -> u64 {
        self.ledger.lock().await.tx_count
    }

    /// Execute a call from `from` against the ledger; `Err` carries the revert reason
    fn apply(
        &self,
        ledger: &mut Ledger,
        from: Address,
        call: &EscrowCall,
    ) -> Result<Option<H256>, String> {
        let now = ledger.timestamp;
        match call {
            EscrowCall::NewContract {
                sender,
                receiver,
                hashlock,
                timelock,
                token,
                amount,
            } => {
                if from != *sender {
                    return Err("lock sender must be msg.sender".to_string());
                }
                if amount.is_zero() {
                    return Err("token amount must be > 0".to_string());
                }
                if *timelock <= now {
                    return Err("timelock time must be in the future".to_string());
                }
                let contract_id = hashlock::escrow_contract_id(
                    *sender, *receiver, *token, *amount, *hashlock, *timelock,
                );
                if ledger.contracts.contains_key(&contract_id) {
                    return Err("Contract already exists".to_string());
                }
                if !ledger.transfer(*token, *sender, self.escrow, *amount) {
                    return Err("transferFrom sender to this failed".to_string());
                }
                ledger.contracts.insert(
                    contract_id,
                    OnChainContract {
                        sender: *sender,
                        receiver: *receiver,
                        token: *token,
                        amount: *amount,
                        hashlock: *hashlock,
                        timelock: *timelock,
                        withdrawn: false,
                        refunded: false,
                        preimage: H256::zero(),
                    },
                );
                Ok(Some(contract_id))
            }
            EscrowCall::Withdraw {
                contract_id,
                preimage,
            } => {
                let contract = ledger
                    .contracts
                    .get(contract_id)
                    .cloned()
                    .ok_or_else(|| "contractId does not exist".to_string())?;
                if contract.receiver != from {
                    return Err("withdrawable: not receiver".to_string());
                }
                if !hashlock::verify(self.algorithm, &Secret::from(*preimage), &contract.hashlock)
                {
                    return Err("hashlock hash does not match".to_string());
                }
                if contract.withdrawn {
                    return Err("withdrawable: already withdrawn".to_string());
                }
                if contract.refunded {
                    return Err("withdrawable: already refunded".to_string());
                }
                if contract.timelock <= now {
                    return Err("withdrawable: timelock time must be in the future".to_string());
                }
                ledger.transfer(contract.token, self.escrow, contract.receiver, contract.amount);
                if let Some(stored) = ledger.contracts.get_mut(contract_id) {
                    stored.withdrawn = true;
                    stored.preimage = *preimage;
                }
                Ok(None)
            }
            EscrowCall::Refund { contract_id } => {
                let contract = ledger
                    .contracts
                    .get(contract_id)
                    .cloned()
                    .ok_or_else(|| "contractId does not exist".to_string())?;
                if contract.sender != from {
                    return Err("refundable: not sender".to_string());
                }
                if contract.refunded {
                    return Err("refundable: already refunded".to_string());
                }
                if contract.withdrawn {
                    return Err("refundable: already withdrawn".to_string());
                }
                if contract.timelock > now {
                    return Err("refundable: timelock not yet passed".to_string());
                }
                ledger.transfer(contract.token, self.escrow, contract.sender, contract.amount);
                if let Some(stored) = ledger.contracts.get_mut(contract_id) {
                    stored.refunded = true;
                }
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn submit_transaction(
        &self,
        from: Address,
        call: &EscrowCall,
    ) -> SettlementResult<TxReceipt> {
        let mut ledger = self.ledger.lock().await;

        if ledger.fail_next > 0 {
            ledger.fail_next -= 1;
            return Err(SettlementError::submission(
                self.chain_id,
                "simulated RPC failure",
            ));
        }

        ledger.tx_count += 1;
        ledger.block_number += 1;
        let mut seed = self.chain_id.to_be_bytes().to_vec();
        seed.extend_from_slice(&ledger.tx_count.to_be_bytes());
        let tx_hash = H256::from(keccak256(&seed));

        let outcome = self.apply(&mut ledger, from, call);
        let receipt = TxReceipt {
            tx_hash,
            block_number: Some(ledger.block_number),
            success: outcome.is_ok(),
            contract_id: outcome.as_ref().ok().copied().flatten(),
        };
        match &outcome {
            Ok(_) => debug!("Simulated chain {} applied {}", self.chain_id, call.name()),
            Err(reason) => debug!(
                "Simulated chain {} reverted {}: {}",
                self.chain_id,
                call.name(),
                reason
            ),
        }
        ledger.receipts.insert(tx_hash, receipt.clone());

        if ledger.land_then_fail > 0 {
            ledger.land_then_fail -= 1;
            return Err(SettlementError::submission(
                self.chain_id,
                "simulated lost response",
            ));
        }

        Ok(receipt)
    }

    async fn get_block_timestamp(&self) -> SettlementResult<u64> {
        Ok(self.ledger.lock().await.timestamp)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        _min_confirmations: u64,
    ) -> SettlementResult<TxReceipt> {
        self.ledger
            .lock()
            .await
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| {
                SettlementError::submission(
                    self.chain_id,
                    format!("unknown transaction {:?}", tx_hash),
                )
            })
    }

    async fn get_contract(&self, contract_id: H256) -> SettlementResult<OnChainContract> {
        Ok(self
            .ledger
            .lock()
            .await
            .contracts
            .get(&contract_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000;

    async fn funded_chain() -> (SimulatedChain, Address, Address, Address) {
        let chain = SimulatedChain::new(1, HashAlgorithm::Sha256, T0);
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let token = Address::repeat_byte(0x70);
        chain.mint(token, alice, U256::from(1_000u64)).await;
        (chain, alice, bob, token)
    }

    fn lock_call(alice: Address, bob: Address, token: Address, hashlock: H256) -> EscrowCall {
        EscrowCall::NewContract {
            sender: alice,
            receiver: bob,
            hashlock,
            timelock: T0 + 3600,
            token,
            amount: U256::from(400u64),
        }
    }

    #[tokio::test]
    async fn test_withdraw_moves_funds_to_receiver() {
        let (chain, alice, bob, token) = funded_chain().await;
        let secret = Secret::random();
        let hashlock = hashlock::commit(HashAlgorithm::Sha256, &secret);

        let receipt = chain
            .submit_transaction(alice, &lock_call(alice, bob, token, hashlock))
            .await
            .unwrap();
        assert!(receipt.success);
        let id = receipt.contract_id.unwrap();
        assert_eq!(chain.balance_of(token, alice).await, U256::from(600u64));

        let withdraw = EscrowCall::Withdraw {
            contract_id: id,
            preimage: secret.to_h256(),
        };
        assert!(chain.submit_transaction(bob, &withdraw).await.unwrap().success);
        assert_eq!(chain.balance_of(token, bob).await, U256::from(400u64));
        let stored = chain.contract(id).await.unwrap();
        assert!(stored.withdrawn);
        assert_eq!(stored.preimage, secret.to_h256());

        // second withdraw reverts
        assert!(!chain.submit_transaction(bob, &withdraw).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_refund_only_after_timelock() {
        let (chain, alice, bob, token) = funded_chain().await;
        let hashlock = hashlock::commit(HashAlgorithm::Sha256, &Secret::random());
        let id = chain
            .submit_transaction(alice, &lock_call(alice, bob, token, hashlock))
            .await
            .unwrap()
            .contract_id
            .unwrap();

        let refund = EscrowCall::Refund { contract_id: id };
        assert!(!chain.submit_transaction(alice, &refund).await.unwrap().success);

        chain.set_time(T0 + 3600).await;
        assert!(chain.submit_transaction(alice, &refund).await.unwrap().success);
        assert_eq!(chain.balance_of(token, alice).await, U256::from(1_000u64));
    }

    #[tokio::test]
    async fn test_wrong_preimage_and_late_withdraw_revert() {
        let (chain, alice, bob, token) = funded_chain().await;
        let secret = Secret::random();
        let hashlock = hashlock::commit(HashAlgorithm::Sha256, &secret);
        let id = chain
            .submit_transaction(alice, &lock_call(alice, bob, token, hashlock))
            .await
            .unwrap()
            .contract_id
            .unwrap();

        let wrong = EscrowCall::Withdraw {
            contract_id: id,
            preimage: Secret::random().to_h256(),
        };
        assert!(!chain.submit_transaction(bob, &wrong).await.unwrap().success);

        chain.advance_time(3600).await;
        let late = EscrowCall::Withdraw {
            contract_id: id,
            preimage: secret.to_h256(),
        };
        assert!(!chain.submit_transaction(bob, &late).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_duplicate_lock_reverts() {
        let (chain, alice, bob, token) = funded_chain().await;
        let call = lock_call(alice, bob, token, H256::repeat_byte(9));
        assert!(chain.submit_transaction(alice, &call).await.unwrap().success);
        assert!(!chain.submit_transaction(alice, &call).await.unwrap().success);
        assert_eq!(chain.balance_of(token, alice).await, U256::from(600u64));
    }

    #[tokio::test]
    async fn test_lost_response_still_lands() {
        let (chain, alice, bob, token) = funded_chain().await;
        let call = lock_call(alice, bob, token, H256::repeat_byte(9));
        chain.land_then_fail_next(1).await;
        assert!(chain.submit_transaction(alice, &call).await.is_err());

        let id = hashlock::escrow_contract_id(
            alice,
            bob,
            token,
            U256::from(400u64),
            H256::repeat_byte(9),
            T0 + 3600,
        );
        assert!(chain.get_contract(id).await.unwrap().exists());
    }

    #[tokio::test]
    async fn test_injected_failure_is_not_applied() {
        let (chain, alice, bob, token) = funded_chain().await;
        chain.fail_next_submissions(1).await;
        let call = lock_call(alice, bob, token, H256::repeat_byte(9));
        let err = chain.submit_transaction(alice, &call).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(chain.transaction_count().await, 0);
        assert_eq!(chain.balance_of(token, alice).await, U256::from(1_000u64));
    }

    #[tokio::test]
    async fn test_calls_require_the_right_msg_sender() {
        let (chain, alice, bob, token) = funded_chain().await;
        let mallory = Address::repeat_byte(0x66);
        let secret = Secret::random();
        let hashlock = hashlock::commit(HashAlgorithm::Sha256, &secret);
        let call = lock_call(alice, bob, token, hashlock);

        // nobody locks alice's funds but alice
        assert!(!chain.submit_transaction(mallory, &call).await.unwrap().success);
        assert_eq!(chain.balance_of(token, alice).await, U256::from(1_000u64));

        let id = chain
            .submit_transaction(alice, &call)
            .await
            .unwrap()
            .contract_id
            .unwrap();
        let withdraw = EscrowCall::Withdraw {
            contract_id: id,
            preimage: secret.to_h256(),
        };
        assert!(!chain.submit_transaction(alice, &withdraw).await.unwrap().success);
        assert!(!chain.submit_transaction(mallory, &withdraw).await.unwrap().success);

        chain.set_time(T0 + 3600).await;
        let refund = EscrowCall::Refund { contract_id: id };
        assert!(!chain.submit_transaction(bob, &refund).await.unwrap().success);
        assert!(chain.submit_transaction(alice, &refund).await.unwrap().success);
        assert_eq!(chain.balance_of(token, alice).await, U256::from(1_000u64));
    }
}

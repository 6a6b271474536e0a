//! Escrow operations for one chain

use super::{HtlcContract, HtlcState, LockParams};
use crate::chain::{ChainClient, EscrowCall, OnChainContract, TxReceipt};
use crate::error::{SettlementError, SettlementResult};
use crate::hashlock::{self, HashAlgorithm, Secret};
use crate::state::SettlementStore;

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Creates, claims and refunds escrow legs on one chain
pub struct HtlcManager {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn SettlementStore>,
    algorithm: HashAlgorithm,
    min_confirmations: u64,
    /// Serializes claim/refund per lock
    guards: DashMap<H256, Arc<Mutex<()>>>,
}

impl HtlcManager {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn SettlementStore>,
        algorithm: HashAlgorithm,
        min_confirmations: u64,
    ) -> Self {
        Self {
            client,
            store,
            algorithm,
            min_confirmations,
            guards: DashMap::new(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Latest block time of this chain
    pub async fn now(&self) -> SettlementResult<u64> {
        self.client.get_block_timestamp().await
    }

    fn guard(&self, lock_id: H256) -> Arc<Mutex<()>> {
        self.guards
            .entry(lock_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock funds in a new escrow; returns the escrow's contract id
    pub async fn create_lock(&self, params: LockParams) -> SettlementResult<H256> {
        let chain_id = self.chain_id();
        let now = self.now().await?;
        if params.timelock <= now {
            return Err(SettlementError::InvalidTimelock(format!(
                "timelock {} is not after chain {} time {}",
                params.timelock, chain_id, now
            )));
        }

        let expected_id = params.contract_id();
        let guard = self.guard(expected_id);
        let _held = guard.lock().await;

        // A previous attempt may already have landed
        if self.client.get_contract(expected_id).await?.exists() {
            warn!(
                "Lock {:?} already exists on chain {}, adopting",
                expected_id, chain_id
            );
            self.record(expected_id, None, None).await?;
            return Ok(expected_id);
        }

        let call = EscrowCall::NewContract {
            sender: params.sender,
            receiver: params.receiver,
            hashlock: params.hashlock,
            timelock: params.timelock,
            token: params.token,
            amount: params.amount,
        };

        let receipt = match self.submit_and_confirm(params.sender, &call).await {
            Ok(receipt) if receipt.success => receipt,
            outcome => {
                // The caller keeps `expected_id` and re-checks it later if this read fails
                let landed = match self.client.get_contract(expected_id).await {
                    Ok(contract) => contract.exists(),
                    Err(e) => {
                        warn!(
                            "Could not check whether lock {:?} landed on chain {}: {}",
                            expected_id, chain_id, e
                        );
                        false
                    }
                };
                if landed {
                    warn!(
                        "newContract on chain {} reported failure but lock {:?} landed",
                        chain_id, expected_id
                    );
                    let tx = outcome.ok().map(|r| r.tx_hash);
                    self.record(expected_id, tx, None).await?;
                    return Ok(expected_id);
                }
                return Err(match outcome {
                    Ok(receipt) => SettlementError::reverted(
                        chain_id,
                        format!("newContract reverted in {:?}", receipt.tx_hash),
                    ),
                    Err(e) => e,
                });
            }
        };

        let lock_id = match receipt.contract_id {
            Some(id) if id != expected_id => {
                warn!(
                    "Escrow on chain {} emitted contract id {:?}, expected {:?}",
                    chain_id, id, expected_id
                );
                id
            }
            Some(id) => id,
            None => expected_id,
        };

        self.record(lock_id, Some(receipt.tx_hash), None).await?;
        crate::metrics::record_htlc_transition(chain_id, HtlcState::Active.as_str());
        info!(
            "Created lock {:?} on chain {} (timelock {}, tx {:?})",
            lock_id, chain_id, params.timelock, receipt.tx_hash
        );
        Ok(lock_id)
    }

    /// Claim a lock with its preimage; returns the withdraw transaction hash
    ///
    /// If the withdraw landed but its receipt was lost, the returned hash is
    /// zero and the lock is still recorded as redeemed.
    pub async fn claim(&self, lock_id: H256, preimage: &Secret) -> SettlementResult<H256> {
        let chain_id = self.chain_id();
        let guard = self.guard(lock_id);
        let _held = guard.lock().await;

        let (contract, now) = self.read_chain(lock_id).await?;
        if !hashlock::verify(self.algorithm, preimage, &contract.hashlock) {
            return Err(SettlementError::InvalidPreimage {
                lock_id: format!("{:?}", lock_id),
            });
        }
        let state = HtlcState::derive(contract.withdrawn, contract.refunded, contract.timelock, now);
        if state.is_terminal() {
            return Err(SettlementError::AlreadySettled {
                lock_id: format!("{:?}", lock_id),
                state: state.to_string(),
            });
        }
        if now >= contract.timelock {
            return Err(SettlementError::TimelockExpired {
                lock_id: format!("{:?}", lock_id),
                now,
                timelock: contract.timelock,
            });
        }

        let call = EscrowCall::Withdraw {
            contract_id: lock_id,
            preimage: preimage.to_h256(),
        };
        let outcome = self.submit_and_confirm(contract.receiver, &call).await;
        if let Ok(receipt) = &outcome {
            if receipt.success {
                self.record(lock_id, None, Some(receipt.tx_hash)).await?;
                crate::metrics::record_htlc_transition(chain_id, HtlcState::Redeemed.as_str());
                info!("Claimed lock {:?} on chain {}", lock_id, chain_id);
                return Ok(receipt.tx_hash);
            }
        }

        // Re-derive before reporting: a concurrent or lost withdraw may have landed
        let (after, _) = self.read_chain(lock_id).await?;
        if after.withdrawn && after.preimage == preimage.to_h256() {
            warn!(
                "Withdraw of lock {:?} on chain {} settled despite failed submission",
                lock_id, chain_id
            );
            let tx = outcome.as_ref().map(|r| r.tx_hash).unwrap_or_default();
            self.record(lock_id, None, Some(tx)).await?;
            crate::metrics::record_htlc_transition(chain_id, HtlcState::Redeemed.as_str());
            return Ok(tx);
        }
        if after.refunded {
            self.record(lock_id, None, None).await?;
            return Err(SettlementError::AlreadySettled {
                lock_id: format!("{:?}", lock_id),
                state: HtlcState::Refunded.to_string(),
            });
        }
        Err(match outcome {
            Ok(receipt) => SettlementError::reverted(
                chain_id,
                format!("withdraw reverted in {:?}", receipt.tx_hash),
            ),
            Err(e) => e,
        })
    }

    /// Return an expired lock's funds to its sender
    pub async fn refund(&self, lock_id: H256) -> SettlementResult<H256> {
        let chain_id = self.chain_id();
        let guard = self.guard(lock_id);
        let _held = guard.lock().await;

        let (contract, now) = self.read_chain(lock_id).await?;
        let state = HtlcState::derive(contract.withdrawn, contract.refunded, contract.timelock, now);
        if state.is_terminal() {
            self.record(lock_id, None, None).await?;
            return Err(SettlementError::AlreadySettled {
                lock_id: format!("{:?}", lock_id),
                state: state.to_string(),
            });
        }
        if now < contract.timelock {
            return Err(SettlementError::TimelockNotExpired {
                lock_id: format!("{:?}", lock_id),
                now,
                timelock: contract.timelock,
            });
        }

        let call = EscrowCall::Refund {
            contract_id: lock_id,
        };
        let outcome = self.submit_and_confirm(contract.sender, &call).await;
        if let Ok(receipt) = &outcome {
            if receipt.success {
                self.record(lock_id, None, Some(receipt.tx_hash)).await?;
                crate::metrics::record_htlc_transition(chain_id, HtlcState::Refunded.as_str());
                info!("Refunded lock {:?} on chain {}", lock_id, chain_id);
                return Ok(receipt.tx_hash);
            }
        }

        let (after, _) = self.read_chain(lock_id).await?;
        if after.refunded {
            warn!(
                "Refund of lock {:?} on chain {} settled despite failed submission",
                lock_id, chain_id
            );
            let tx = outcome.as_ref().map(|r| r.tx_hash).unwrap_or_default();
            self.record(lock_id, None, Some(tx)).await?;
            crate::metrics::record_htlc_transition(chain_id, HtlcState::Refunded.as_str());
            return Ok(tx);
        }
        if after.withdrawn {
            self.record(lock_id, None, None).await?;
            return Err(SettlementError::AlreadySettled {
                lock_id: format!("{:?}", lock_id),
                state: HtlcState::Redeemed.to_string(),
            });
        }
        Err(match outcome {
            Ok(receipt) => SettlementError::reverted(
                chain_id,
                format!("refund reverted in {:?}", receipt.tx_hash),
            ),
            Err(e) => e,
        })
    }

    /// Current state of a lock, derived from chain data and written back
    pub async fn get_status(&self, lock_id: H256) -> SettlementResult<HtlcContract> {
        self.record(lock_id, None, None).await
    }

    /// Current state of a lock that may never have been created
    pub async fn find_lock(&self, lock_id: H256) -> SettlementResult<Option<HtlcContract>> {
        if !self.client.get_contract(lock_id).await?.exists() {
            return Ok(None);
        }
        self.record(lock_id, None, None).await.map(Some)
    }

    /// Preimage stored by the escrow when the lock was withdrawn
    pub async fn revealed_preimage(&self, lock_id: H256) -> SettlementResult<Option<Secret>> {
        let (contract, _) = self.read_chain(lock_id).await?;
        if !contract.withdrawn || contract.preimage.is_zero() {
            return Ok(None);
        }
        let secret = Secret::from(contract.preimage);
        if !hashlock::verify(self.algorithm, &secret, &contract.hashlock) {
            warn!(
                "Lock {:?} on chain {} holds a preimage that does not match its hashlock",
                lock_id,
                self.chain_id()
            );
            return Ok(None);
        }
        Ok(Some(secret))
    }

    async fn read_chain(&self, lock_id: H256) -> SettlementResult<(OnChainContract, u64)> {
        let contract = self.client.get_contract(lock_id).await?;
        if !contract.exists() {
            return Err(SettlementError::LockNotFound {
                chain_id: self.chain_id(),
                lock_id: format!("{:?}", lock_id),
            });
        }
        let now = self.now().await?;
        Ok((contract, now))
    }

    async fn submit_and_confirm(
        &self,
        from: Address,
        call: &EscrowCall,
    ) -> SettlementResult<TxReceipt> {
        let submitted = self.client.submit_transaction(from, call).await?;
        debug!(
            "Submitted {} on chain {}: {:?}",
            call.name(),
            self.chain_id(),
            submitted.tx_hash
        );
        self.client
            .wait_for_confirmation(submitted.tx_hash, self.min_confirmations)
            .await
    }

    /// Re-read a lock from chain, merge with the stored record and persist it
    async fn record(
        &self,
        lock_id: H256,
        lock_tx: Option<H256>,
        settle_tx: Option<H256>,
    ) -> SettlementResult<HtlcContract> {
        let chain_id = self.chain_id();
        let (contract, now) = self.read_chain(lock_id).await?;
        let previous = self.store.get_htlc(chain_id, lock_id).await?;

        let state = HtlcState::derive(contract.withdrawn, contract.refunded, contract.timelock, now);
        let record = HtlcContract {
            lock_id,
            chain_id,
            sender: contract.sender,
            receiver: contract.receiver,
            token_address: contract.token,
            amount: contract.amount,
            hashlock: contract.hashlock,
            timelock: contract.timelock,
            state,
            preimage: contract.withdrawn.then_some(contract.preimage),
            lock_tx: lock_tx.or_else(|| previous.as_ref().and_then(|p| p.lock_tx)),
            settle_tx: settle_tx.or_else(|| previous.as_ref().and_then(|p| p.settle_tx)),
            updated_at: Utc::now(),
        };

        if let Some(previous) = &previous {
            if previous.state.is_terminal() && previous.state != record.state {
                // Terminal states never change on chain
                return Err(SettlementError::StateMismatch {
                    expected: previous.state.to_string(),
                    actual: record.state.to_string(),
                });
            }
        }

        self.store.put_htlc(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;
    use crate::state::MemoryStore;
    use ethers::types::{Address, U256};

    const T0: u64 = 1_700_000_000;

    struct Fixture {
        chain: Arc<SimulatedChain>,
        manager: HtlcManager,
        alice: Address,
        bob: Address,
        token: Address,
    }

    async fn fixture() -> Fixture {
        let chain = Arc::new(SimulatedChain::new(1, HashAlgorithm::Sha256, T0));
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let token = Address::repeat_byte(0x70);
        chain.mint(token, alice, U256::from(1_000u64)).await;
        let manager = HtlcManager::new(
            chain.clone(),
            Arc::new(MemoryStore::new()),
            HashAlgorithm::Sha256,
            1,
        );
        Fixture {
            chain,
            manager,
            alice,
            bob,
            token,
        }
    }

    fn params(f: &Fixture, secret: &Secret) -> LockParams {
        LockParams {
            hashlock: hashlock::commit(HashAlgorithm::Sha256, secret),
            timelock: T0 + 3600,
            amount: U256::from(250u64),
            sender: f.alice,
            receiver: f.bob,
            token: f.token,
        }
    }

    #[tokio::test]
    async fn test_find_lock_by_expected_id() {
        let f = fixture().await;
        let secret = Secret::random();
        let p = params(&f, &secret);
        let expected = p.contract_id();
        assert!(f.manager.find_lock(expected).await.unwrap().is_none());

        let lock_id = f.manager.create_lock(p).await.unwrap();
        assert_eq!(lock_id, expected);
        let found = f.manager.find_lock(expected).await.unwrap().unwrap();
        assert_eq!(found.state, HtlcState::Active);
        assert_eq!(found.sender, f.alice);
    }

    #[tokio::test]
    async fn test_create_and_claim() {
        let f = fixture().await;
        let secret = Secret::random();
        let lock_id = f.manager.create_lock(params(&f, &secret)).await.unwrap();

        let status = f.manager.get_status(lock_id).await.unwrap();
        assert_eq!(status.state, HtlcState::Active);
        assert!(status.lock_tx.is_some());

        f.manager.claim(lock_id, &secret).await.unwrap();
        let status = f.manager.get_status(lock_id).await.unwrap();
        assert_eq!(status.state, HtlcState::Redeemed);
        assert_eq!(status.preimage, Some(secret.to_h256()));
        assert_eq!(f.chain.balance_of(f.token, f.bob).await, U256::from(250u64));
        assert_eq!(
            f.manager.revealed_preimage(lock_id).await.unwrap(),
            Some(secret)
        );
    }

    #[tokio::test]
    async fn test_rejects_timelock_in_past() {
        let f = fixture().await;
        let mut p = params(&f, &Secret::random());
        p.timelock = T0;
        let err = f.manager.create_lock(p).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidTimelock(_)));
        assert_eq!(f.chain.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_preimage_rejected_before_submission() {
        let f = fixture().await;
        let lock_id = f
            .manager
            .create_lock(params(&f, &Secret::random()))
            .await
            .unwrap();
        let submitted = f.chain.transaction_count().await;

        let err = f.manager.claim(lock_id, &Secret::random()).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPreimage { .. }));
        assert_eq!(f.chain.transaction_count().await, submitted);
    }

    #[tokio::test]
    async fn test_claim_after_expiry_rejected() {
        let f = fixture().await;
        let secret = Secret::random();
        let lock_id = f.manager.create_lock(params(&f, &secret)).await.unwrap();
        f.chain.set_time(T0 + 3600).await;

        let err = f.manager.claim(lock_id, &secret).await.unwrap_err();
        assert!(matches!(err, SettlementError::TimelockExpired { .. }));
        assert_eq!(
            f.manager.get_status(lock_id).await.unwrap().state,
            HtlcState::Expired
        );
    }

    #[tokio::test]
    async fn test_no_premature_refund() {
        let f = fixture().await;
        let lock_id = f
            .manager
            .create_lock(params(&f, &Secret::random()))
            .await
            .unwrap();

        for offset in [0, 1, 1800, 3599] {
            f.chain.set_time(T0 + offset).await;
            let err = f.manager.refund(lock_id).await.unwrap_err();
            assert!(matches!(err, SettlementError::TimelockNotExpired { .. }));
        }

        f.chain.set_time(T0 + 3600).await;
        f.manager.refund(lock_id).await.unwrap();
        assert_eq!(
            f.manager.get_status(lock_id).await.unwrap().state,
            HtlcState::Refunded
        );
        assert_eq!(
            f.chain.balance_of(f.token, f.alice).await,
            U256::from(1_000u64)
        );
    }

    #[tokio::test]
    async fn test_redeemed_and_refunded_are_exclusive() {
        let f = fixture().await;
        let secret = Secret::random();
        let lock_id = f.manager.create_lock(params(&f, &secret)).await.unwrap();
        f.manager.claim(lock_id, &secret).await.unwrap();

        f.chain.set_time(T0 + 7200).await;
        let err = f.manager.refund(lock_id).await.unwrap_err();
        assert!(matches!(err, SettlementError::AlreadySettled { .. }));
        let err = f.manager.claim(lock_id, &secret).await.unwrap_err();
        assert!(matches!(err, SettlementError::AlreadySettled { .. }));
    }

    #[tokio::test]
    async fn test_lost_create_response_is_adopted() {
        let f = fixture().await;
        let secret = Secret::random();
        f.chain.land_then_fail_next(1).await;

        let lock_id = f.manager.create_lock(params(&f, &secret)).await.unwrap();
        assert!(f.chain.contract(lock_id).await.is_some());
        // funds moved exactly once
        assert_eq!(f.chain.balance_of(f.token, f.alice).await, U256::from(750u64));
    }

    #[tokio::test]
    async fn test_transient_create_failure_propagates() {
        let f = fixture().await;
        f.chain.fail_next_submissions(1).await;
        let err = f
            .manager
            .create_lock(params(&f, &Secret::random()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_lock() {
        let f = fixture().await;
        let err = f.manager.get_status(H256::repeat_byte(0x55)).await.unwrap_err();
        assert!(matches!(err, SettlementError::LockNotFound { chain_id: 1, .. }));
    }
}

//! Drives both legs of a swap through their escrows

use super::{AtomicSwap, LegRole, LegTerms, SwapConfig, SwapLeg, SwapStatus};
use crate::error::{SettlementError, SettlementResult};
use crate::hashlock::{self, Secret};
use crate::htlc::{HtlcContract, HtlcManager, HtlcState, LockParams};
use crate::state::SettlementStore;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coordinates swaps across the chains it holds an `HtlcManager` for
pub struct SwapCoordinator {
    managers: HashMap<u64, Arc<HtlcManager>>,
    store: Arc<dyn SettlementStore>,
    config: SwapConfig,
    /// Held only for a swap record's read-modify-write
    records: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Held across the chain calls of one leg
    legs: DashMap<(Uuid, LegRole), Arc<Mutex<()>>>,
}

impl SwapCoordinator {
    pub fn new(
        managers: HashMap<u64, Arc<HtlcManager>>,
        store: Arc<dyn SettlementStore>,
        config: SwapConfig,
    ) -> SettlementResult<Self> {
        if config.safety_margin_secs == 0 {
            return Err(SettlementError::Config(
                "safety margin must be positive".to_string(),
            ));
        }
        if config.safety_margin_secs <= config.max_chain_skew_secs {
            return Err(SettlementError::Config(format!(
                "safety margin {}s must exceed max chain skew {}s",
                config.safety_margin_secs, config.max_chain_skew_secs
            )));
        }
        if let Some(manager) = managers
            .values()
            .find(|m| m.algorithm() != config.algorithm)
        {
            return Err(SettlementError::Config(format!(
                "chain {} uses {:?}, swaps use {:?}",
                manager.chain_id(),
                manager.algorithm(),
                config.algorithm
            )));
        }

        Ok(Self {
            managers,
            store,
            config,
            records: DashMap::new(),
            legs: DashMap::new(),
        })
    }

    pub fn config(&self) -> SwapConfig {
        self.config
    }

    fn manager(&self, chain_id: u64) -> SettlementResult<&Arc<HtlcManager>> {
        self.managers
            .get(&chain_id)
            .ok_or(SettlementError::UnknownChain { chain_id })
    }

    fn leg_guard(&self, swap_id: Uuid, role: LegRole) -> Arc<Mutex<()>> {
        self.legs
            .entry((swap_id, role))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a swap record with a fresh secret; nothing touches the chain yet
    pub async fn initiate_swap(
        &self,
        initiator: LegTerms,
        participant: LegTerms,
        timelock_duration: u64,
    ) -> SettlementResult<AtomicSwap> {
        if timelock_duration <= self.config.safety_margin_secs {
            return Err(SettlementError::InvalidTimelock(format!(
                "duration {}s must exceed safety margin {}s",
                timelock_duration, self.config.safety_margin_secs
            )));
        }
        let source = self.manager(initiator.chain_id)?;
        self.manager(participant.chain_id)?;

        let now = source.now().await?;
        let timelock = now.checked_add(timelock_duration).ok_or_else(|| {
            SettlementError::InvalidTimelock(format!(
                "duration {}s overflows chain time {}",
                timelock_duration, now
            ))
        })?;
        let participant_timelock = timelock - self.config.safety_margin_secs;

        let secret = Secret::random();
        let secret_hash = hashlock::commit(self.config.algorithm, &secret);
        let created_at = Utc::now();
        let swap = AtomicSwap {
            id: Uuid::new_v4(),
            intent_id: None,
            secret,
            secret_hash,
            algorithm: self.config.algorithm,
            timelock_duration,
            initiator: SwapLeg::new(initiator, timelock),
            participant: SwapLeg::new(participant, participant_timelock),
            status: SwapStatus::Initiated,
            failure: None,
            created_at,
            updated_at: created_at,
        };
        self.store.put_swap(&swap).await?;

        crate::metrics::record_swap(SwapStatus::Initiated.as_str());
        info!(
            "Initiated swap {}: chain {} -> chain {}, timelocks {} / {}",
            swap.id,
            swap.initiator.terms.chain_id,
            swap.participant.terms.chain_id,
            timelock,
            participant_timelock
        );
        Ok(swap)
    }

    /// Record which intent a swap settles
    pub async fn attach_intent(&self, swap_id: Uuid, intent_id: H256) -> SettlementResult<()> {
        self.update(swap_id, |s| s.intent_id = Some(intent_id)).await?;
        Ok(())
    }

    /// Swaps that are not terminal or still hold funds in an escrow
    pub async fn open_swaps(&self) -> SettlementResult<Vec<AtomicSwap>> {
        self.store.list_unsettled_swaps().await
    }

    /// Whether each chain answers a block time query
    pub async fn chain_health(&self) -> Vec<(u64, bool)> {
        let checks = self.managers.iter().map(|(chain_id, manager)| async move {
            let healthy = manager.now().await.is_ok();
            crate::metrics::record_chain_health(*chain_id, healthy);
            (*chain_id, healthy)
        });
        let mut health = join_all(checks).await;
        health.sort_by_key(|(chain_id, _)| *chain_id);
        health
    }

    pub async fn get_swap(&self, swap_id: Uuid) -> SettlementResult<AtomicSwap> {
        self.store
            .get_swap(swap_id)
            .await?
            .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))
    }

    /// Lock the initiator's funds; the swap fails if the lock cannot be created
    pub async fn lock_initiator_funds(&self, swap_id: Uuid) -> SettlementResult<HtlcContract> {
        let guard = self.leg_guard(swap_id, LegRole::Initiator);
        let _held = guard.lock().await;

        let swap = self.get_swap(swap_id).await?;
        expect_status(&swap, SwapStatus::Initiated)?;
        self.open_leg(swap, LegRole::Initiator).await
    }

    /// Lock the participant's funds once the initiator escrow is confirmed
    pub async fn lock_participant_funds(&self, swap_id: Uuid) -> SettlementResult<HtlcContract> {
        let guard = self.leg_guard(swap_id, LegRole::Participant);
        let _held = guard.lock().await;

        let swap = self.get_swap(swap_id).await?;
        expect_status(&swap, SwapStatus::Locked)?;
        if swap.participant.lock_id.is_some() {
            return Err(SettlementError::StateMismatch {
                expected: "participant leg unlocked".to_string(),
                actual: "participant leg locked".to_string(),
            });
        }

        let initiator_lock = locked_id(&swap, LegRole::Initiator)?;
        let initiator = self
            .manager(swap.initiator.terms.chain_id)?
            .get_status(initiator_lock)
            .await?;
        if initiator.state != HtlcState::Active
            || initiator.hashlock != swap.secret_hash
            || initiator.timelock != swap.initiator.timelock
        {
            warn!(
                "Swap {}: initiator lock {:?} is {} with timelock {}, refusing participant lock",
                swap_id, initiator_lock, initiator.state, initiator.timelock
            );
            return Err(SettlementError::StateMismatch {
                expected: format!(
                    "active initiator lock with timelock {}",
                    swap.initiator.timelock
                ),
                actual: format!("{} with timelock {}", initiator.state, initiator.timelock),
            });
        }

        self.open_leg(swap, LegRole::Participant).await
    }

    async fn open_leg(&self, swap: AtomicSwap, role: LegRole) -> SettlementResult<HtlcContract> {
        let leg = swap.leg(role);
        let manager = self.manager(leg.terms.chain_id)?;
        let params = LockParams {
            hashlock: swap.secret_hash,
            timelock: leg.timelock,
            amount: leg.terms.amount,
            sender: leg.terms.sender,
            receiver: leg.terms.receiver,
            token: leg.terms.token,
        };

        // Kept until the outcome is known; recovery re-checks it if this call fails
        let expected = params.contract_id();
        self.update(swap.id, |s| s.leg_mut(role).pending_lock = Some(expected))
            .await?;

        let lock_id = match manager.create_lock(params).await {
            Ok(lock_id) => lock_id,
            Err(e) => {
                error!("Swap {}: {} lock failed: {}", swap.id, role, e);
                let reason = format!("{} lock failed: {}", role, e);
                self.update(swap.id, |s| {
                    s.status = SwapStatus::Failed;
                    s.failure = Some(reason);
                })
                .await?;
                crate::metrics::record_swap(SwapStatus::Failed.as_str());
                return Err(e);
            }
        };

        self.update(swap.id, |s| {
            let leg = s.leg_mut(role);
            leg.lock_id = Some(lock_id);
            leg.pending_lock = None;
            leg.state = Some(HtlcState::Active);
            if role == LegRole::Initiator {
                s.status = SwapStatus::Locked;
            }
        })
        .await?;
        if role == LegRole::Initiator {
            crate::metrics::record_swap(SwapStatus::Locked.as_str());
        }
        info!(
            "Swap {}: {} funds locked on chain {} as {:?}",
            swap.id,
            role,
            manager.chain_id(),
            lock_id
        );

        manager.get_status(lock_id).await
    }

    /// The initiator claims the participant leg, revealing the secret on chain
    pub async fn redeem_participant(&self, swap_id: Uuid) -> SettlementResult<H256> {
        let guard = self.leg_guard(swap_id, LegRole::Participant);
        let _held = guard.lock().await;

        let swap = self.get_swap(swap_id).await?;
        expect_status(&swap, SwapStatus::Locked)?;
        let lock_id = locked_id(&swap, LegRole::Participant)?;

        let tx = self
            .manager(swap.participant.terms.chain_id)?
            .claim(lock_id, &swap.secret)
            .await?;

        self.update(swap_id, |s| {
            s.participant.state = Some(HtlcState::Redeemed);
            s.participant.settle_tx = Some(tx);
        })
        .await?;
        info!("Swap {}: participant leg redeemed, secret revealed", swap_id);
        Ok(tx)
    }

    /// The participant claims the initiator leg with the revealed secret
    pub async fn redeem_initiator(&self, swap_id: Uuid, secret: &Secret) -> SettlementResult<H256> {
        let guard = self.leg_guard(swap_id, LegRole::Initiator);
        let _held = guard.lock().await;

        let swap = self.get_swap(swap_id).await?;
        let lock_id = locked_id(&swap, LegRole::Initiator)?;
        if !hashlock::verify(swap.algorithm, secret, &swap.secret_hash) {
            return Err(SettlementError::InvalidPreimage {
                lock_id: format!("{:?}", lock_id),
            });
        }
        expect_status(&swap, SwapStatus::Locked)?;

        let tx = self
            .manager(swap.initiator.terms.chain_id)?
            .claim(lock_id, secret)
            .await?;

        let participant_state = match swap.participant.lock_id {
            Some(participant_lock) => self
                .manager(swap.participant.terms.chain_id)?
                .get_status(participant_lock)
                .await
                .map(|c| c.state)
                .ok(),
            None => None,
        };
        let updated = self
            .update(swap_id, |s| {
                s.initiator.state = Some(HtlcState::Redeemed);
                s.initiator.settle_tx = Some(tx);
                if participant_state.is_some() {
                    s.participant.state = participant_state;
                }
                s.status = SwapStatus::Completed;
            })
            .await?;

        record_outcome(&updated);
        info!("Swap {} completed", swap_id);
        Ok(tx)
    }

    /// Refund the initiator leg after its timelock
    pub async fn refund_initiator(&self, swap_id: Uuid) -> SettlementResult<H256> {
        self.refund_leg(swap_id, LegRole::Initiator).await
    }

    /// Refund the participant leg after its timelock
    pub async fn refund_participant(&self, swap_id: Uuid) -> SettlementResult<H256> {
        self.refund_leg(swap_id, LegRole::Participant).await
    }

    async fn refund_leg(&self, swap_id: Uuid, role: LegRole) -> SettlementResult<H256> {
        let guard = self.leg_guard(swap_id, role);
        let _held = guard.lock().await;

        let swap = self.get_swap(swap_id).await?;
        if swap.status == SwapStatus::Initiated {
            return Err(SettlementError::StateMismatch {
                expected: "a locked leg".to_string(),
                actual: swap.status.to_string(),
            });
        }
        let lock_id = locked_id(&swap, role)?;

        let tx = self
            .manager(swap.leg(role).terms.chain_id)?
            .refund(lock_id)
            .await?;

        let updated = self
            .update(swap_id, |s| {
                let leg = s.leg_mut(role);
                leg.state = Some(HtlcState::Refunded);
                leg.settle_tx = Some(tx);
                // a completed swap keeps its status; its funds already moved
                if s.status != SwapStatus::Completed {
                    s.status = SwapStatus::Refunded;
                }
            })
            .await?;

        if swap.status != updated.status {
            record_outcome(&updated);
        }
        info!("Swap {}: {} leg refunded", swap_id, role);
        Ok(tx)
    }

    /// Re-derive both legs from chain and reconcile the swap status
    pub async fn refresh(&self, swap_id: Uuid) -> SettlementResult<AtomicSwap> {
        let swap = self.get_swap(swap_id).await?;
        let mut observed = Vec::new();
        for role in [LegRole::Initiator, LegRole::Participant] {
            let leg = swap.leg(role);
            if let Some(lock_id) = leg.lock_id {
                let contract = self
                    .manager(leg.terms.chain_id)?
                    .get_status(lock_id)
                    .await?;
                observed.push((role, contract.state));
            }
        }

        let updated = self
            .update(swap_id, |s| {
                for (role, state) in observed {
                    s.leg_mut(role).state = Some(state);
                }
                let redeemed = |state: Option<HtlcState>| state == Some(HtlcState::Redeemed);
                let refunded = |state: Option<HtlcState>| state == Some(HtlcState::Refunded);
                if redeemed(s.initiator.state) && redeemed(s.participant.state) {
                    s.status = SwapStatus::Completed;
                } else if s.status != SwapStatus::Completed
                    && (refunded(s.initiator.state) || refunded(s.participant.state))
                {
                    s.status = SwapStatus::Refunded;
                }
            })
            .await?;

        if swap.status != updated.status {
            record_outcome(&updated);
            info!(
                "Swap {} reconciled from chain: {} -> {}",
                swap_id, swap.status, updated.status
            );
        }
        Ok(updated)
    }

    /// Secret stored by the participant escrow once it was withdrawn
    pub async fn observe_revealed_secret(&self, swap_id: Uuid) -> SettlementResult<Option<Secret>> {
        let swap = self.get_swap(swap_id).await?;
        let Some(lock_id) = swap.participant.lock_id else {
            return Ok(None);
        };
        let revealed = self
            .manager(swap.participant.terms.chain_id)?
            .revealed_preimage(lock_id)
            .await?;
        Ok(revealed.filter(|s| hashlock::verify(swap.algorithm, s, &swap.secret_hash)))
    }

    /// Claim the initiator leg if the secret has been revealed on chain
    pub async fn complete_from_chain(&self, swap_id: Uuid) -> SettlementResult<Option<H256>> {
        let swap = self.get_swap(swap_id).await?;
        if swap.status != SwapStatus::Locked || swap.initiator.state == Some(HtlcState::Redeemed) {
            return Ok(None);
        }
        match self.observe_revealed_secret(swap_id).await? {
            Some(secret) => {
                debug!("Swap {}: secret observed on chain {}", swap_id, swap.participant.terms.chain_id);
                self.redeem_initiator(swap_id, &secret).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Refund every open leg whose timelock has passed on its chain
    pub async fn refund_expired(&self) -> SettlementResult<Vec<(Uuid, LegRole, H256)>> {
        let mut refunded = Vec::new();

        for swap in self.store.list_unsettled_swaps().await? {
            let swap = if swap.initiator.pending_lock.is_some()
                || swap.participant.pending_lock.is_some()
            {
                match self.reconcile_pending(swap.clone()).await {
                    Ok(swap) => swap,
                    Err(e) => {
                        warn!("Swap {}: pending lock check failed: {}", swap.id, e);
                        swap
                    }
                }
            } else {
                swap
            };

            if swap.status == SwapStatus::Initiated {
                if let Err(e) = self.expire_unlocked(&swap).await {
                    warn!("Swap {}: expiry check failed: {}", swap.id, e);
                }
                continue;
            }

            let swap = match self.refresh(swap.id).await {
                Ok(swap) => swap,
                Err(e) => {
                    warn!("Swap {}: refresh failed: {}", swap.id, e);
                    continue;
                }
            };

            for role in [LegRole::Initiator, LegRole::Participant] {
                let leg = swap.leg(role);
                if !leg.holds_funds() || leg.state != Some(HtlcState::Expired) {
                    continue;
                }
                match self.refund_leg(swap.id, role).await {
                    Ok(tx) => refunded.push((swap.id, role, tx)),
                    Err(e) => warn!("Swap {}: {} refund failed: {}", swap.id, role, e),
                }
            }
        }

        if !refunded.is_empty() {
            info!("Recovery refunded {} expired legs", refunded.len());
        }
        Ok(refunded)
    }

    /// Adopt lock submissions that landed; forget those that no longer can
    async fn reconcile_pending(&self, mut swap: AtomicSwap) -> SettlementResult<AtomicSwap> {
        for role in [LegRole::Initiator, LegRole::Participant] {
            let leg = swap.leg(role);
            let Some(expected) = leg.pending_lock else {
                continue;
            };
            let (chain_id, timelock) = (leg.terms.chain_id, leg.timelock);

            let guard = self.leg_guard(swap.id, role);
            let Ok(_held) = guard.try_lock() else {
                continue;
            };
            let manager = self.manager(chain_id)?;

            swap = match manager.find_lock(expected).await? {
                Some(contract) => {
                    warn!(
                        "Swap {}: {} lock {:?} exists on chain {} despite a failed submission, adopting",
                        swap.id, role, expected, chain_id
                    );
                    self.update(swap.id, |s| {
                        let leg = s.leg_mut(role);
                        leg.lock_id = Some(expected);
                        leg.pending_lock = None;
                        leg.state = Some(contract.state);
                        if role == LegRole::Initiator && s.status == SwapStatus::Initiated {
                            s.status = SwapStatus::Locked;
                        }
                    })
                    .await?
                }
                // newContract reverts once the timelock has passed
                None if manager.now().await? >= timelock => {
                    debug!(
                        "Swap {}: {} lock {:?} never landed on chain {}",
                        swap.id, role, expected, chain_id
                    );
                    self.update(swap.id, |s| s.leg_mut(role).pending_lock = None)
                        .await?
                }
                None => swap,
            };
        }
        Ok(swap)
    }

    /// Fail a swap whose initiator never locked before its timelock
    async fn expire_unlocked(&self, swap: &AtomicSwap) -> SettlementResult<()> {
        let guard = self.leg_guard(swap.id, LegRole::Initiator);
        // a lock in flight owns the leg
        let Ok(_held) = guard.try_lock() else {
            return Ok(());
        };

        let now = self.manager(swap.initiator.terms.chain_id)?.now().await?;
        if now < swap.initiator.timelock {
            return Ok(());
        }
        let updated = self
            .update(swap.id, |s| {
                if s.status == SwapStatus::Initiated {
                    s.status = SwapStatus::Failed;
                    s.failure = Some("expired before initiator lock".to_string());
                }
            })
            .await?;
        if updated.status == SwapStatus::Failed {
            crate::metrics::record_swap(SwapStatus::Failed.as_str());
            warn!("Swap {} expired before any funds were locked", swap.id);
        }
        Ok(())
    }

    async fn update<F>(&self, swap_id: Uuid, apply: F) -> SettlementResult<AtomicSwap>
    where
        F: FnOnce(&mut AtomicSwap),
    {
        let guard = self
            .records
            .entry(swap_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = guard.lock().await;

        let mut swap = self.get_swap(swap_id).await?;
        apply(&mut swap);
        swap.updated_at = Utc::now();
        self.store.put_swap(&swap).await?;
        Ok(swap)
    }
}

fn expect_status(swap: &AtomicSwap, expected: SwapStatus) -> SettlementResult<()> {
    if swap.status != expected {
        return Err(SettlementError::StateMismatch {
            expected: expected.to_string(),
            actual: swap.status.to_string(),
        });
    }
    Ok(())
}

fn locked_id(swap: &AtomicSwap, role: LegRole) -> SettlementResult<H256> {
    swap.leg(role)
        .lock_id
        .ok_or_else(|| SettlementError::StateMismatch {
            expected: format!("{} leg locked", role),
            actual: format!("{} leg has no escrow", role),
        })
}

fn record_outcome(swap: &AtomicSwap) {
    crate::metrics::record_swap(swap.status.as_str());
    let elapsed = (Utc::now() - swap.created_at).num_milliseconds() as f64 / 1000.0;
    crate::metrics::record_swap_latency(swap.status.as_str(), elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClient, EscrowCall, OnChainContract, SimulatedChain, TxReceipt};
    use crate::hashlock::HashAlgorithm;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::state::MemoryStore;
    use ethers::types::{Address, U256};

    const T0: u64 = 1_700_000_000;

    struct Harness {
        source: Arc<SimulatedChain>,
        dest: Arc<SimulatedChain>,
        coordinator: SwapCoordinator,
        user: Address,
        solver: Address,
        eth: Address,
        matic: Address,
    }

    fn units(n: u64) -> U256 {
        U256::from(n) * U256::exp10(18)
    }

    async fn harness() -> Harness {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let source = Arc::new(SimulatedChain::new(1, HashAlgorithm::Sha256, T0));
        let dest = Arc::new(SimulatedChain::new(137, HashAlgorithm::Sha256, T0));
        let user = Address::repeat_byte(0x11);
        let solver = Address::repeat_byte(0x22);
        let eth = Address::repeat_byte(0xee);
        let matic = Address::repeat_byte(0x99);
        source.mint(eth, user, units(10)).await;
        dest.mint(matic, solver, units(5_000)).await;

        let mut managers = HashMap::new();
        managers.insert(
            1,
            Arc::new(HtlcManager::new(
                source.clone(),
                store.clone(),
                HashAlgorithm::Sha256,
                1,
            )),
        );
        managers.insert(
            137,
            Arc::new(HtlcManager::new(
                dest.clone(),
                store.clone(),
                HashAlgorithm::Sha256,
                1,
            )),
        );
        let coordinator = SwapCoordinator::new(managers, store, SwapConfig::default()).unwrap();

        Harness {
            source,
            dest,
            coordinator,
            user,
            solver,
            eth,
            matic,
        }
    }

    fn legs(h: &Harness) -> (LegTerms, LegTerms) {
        (
            LegTerms {
                chain_id: 1,
                sender: h.user,
                receiver: h.solver,
                token: h.eth,
                amount: units(1),
            },
            LegTerms {
                chain_id: 137,
                sender: h.solver,
                receiver: h.user,
                token: h.matic,
                amount: units(2_100),
            },
        )
    }

    async fn locked_swap(h: &Harness) -> Uuid {
        let (initiator, participant) = legs(h);
        let swap = h
            .coordinator
            .initiate_swap(initiator, participant, 3600)
            .await
            .unwrap();
        h.coordinator.lock_initiator_funds(swap.id).await.unwrap();
        h.coordinator.lock_participant_funds(swap.id).await.unwrap();
        swap.id
    }

    #[tokio::test]
    async fn test_timelock_ordering() {
        let h = harness().await;
        let (initiator, participant) = legs(&h);
        let swap = h
            .coordinator
            .initiate_swap(initiator, participant, 3600)
            .await
            .unwrap();

        assert_eq!(swap.status, SwapStatus::Initiated);
        assert_eq!(swap.initiator.timelock, T0 + 3600);
        assert_eq!(swap.participant.timelock, T0 + 1800);
        assert_eq!(
            swap.secret_hash,
            hashlock::commit(HashAlgorithm::Sha256, &swap.secret)
        );
    }

    #[tokio::test]
    async fn test_initiate_rejections() {
        let h = harness().await;
        let (initiator, participant) = legs(&h);

        let err = h
            .coordinator
            .initiate_swap(initiator.clone(), participant.clone(), 1800)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidTimelock(_)));

        let err = h
            .coordinator
            .initiate_swap(initiator.clone(), participant.clone(), u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidTimelock(_)));

        let mut unknown = participant;
        unknown.chain_id = 10;
        let err = h
            .coordinator
            .initiate_swap(initiator, unknown, 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::UnknownChain { chain_id: 10 }));
    }

    #[test]
    fn test_margin_must_exceed_skew() {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let config = SwapConfig {
            safety_margin_secs: 300,
            max_chain_skew_secs: 300,
            algorithm: HashAlgorithm::Sha256,
        };
        assert!(matches!(
            SwapCoordinator::new(HashMap::new(), store.clone(), config),
            Err(SettlementError::Config(_))
        ));

        let config = SwapConfig {
            safety_margin_secs: 0,
            max_chain_skew_secs: 0,
            algorithm: HashAlgorithm::Sha256,
        };
        assert!(SwapCoordinator::new(HashMap::new(), store, config).is_err());
    }

    #[tokio::test]
    async fn test_happy_path() {
        let h = harness().await;
        let id = locked_swap(&h).await;

        h.coordinator.redeem_participant(id).await.unwrap();
        assert_eq!(h.dest.balance_of(h.matic, h.user).await, units(2_100));

        let tx = h.coordinator.complete_from_chain(id).await.unwrap();
        assert!(tx.is_some());

        let swap = h.coordinator.get_swap(id).await.unwrap();
        assert_eq!(swap.status, SwapStatus::Completed);
        assert!(swap.is_settled());
        assert_eq!(h.source.balance_of(h.eth, h.solver).await, units(1));
        assert_eq!(h.source.balance_of(h.eth, h.user).await, units(9));
    }

    #[tokio::test]
    async fn test_redeem_initiator_rejects_wrong_secret() {
        let h = harness().await;
        let id = locked_swap(&h).await;
        let before = h.source.transaction_count().await;

        let err = h
            .coordinator
            .redeem_initiator(id, &Secret::random())
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidPreimage { .. }));
        assert_eq!(h.source.transaction_count().await, before);
        assert_eq!(
            h.coordinator.get_swap(id).await.unwrap().status,
            SwapStatus::Locked
        );
    }

    #[tokio::test]
    async fn test_refund_path() {
        let h = harness().await;
        let id = locked_swap(&h).await;

        h.source.set_time(T0 + 1800).await;
        h.dest.set_time(T0 + 1800).await;
        h.coordinator.refund_participant(id).await.unwrap();
        let err = h.coordinator.refund_initiator(id).await.unwrap_err();
        assert!(matches!(err, SettlementError::TimelockNotExpired { .. }));
        assert_eq!(
            h.coordinator.get_swap(id).await.unwrap().status,
            SwapStatus::Refunded
        );

        h.source.set_time(T0 + 3600).await;
        h.coordinator.refund_initiator(id).await.unwrap();

        let swap = h.coordinator.get_swap(id).await.unwrap();
        assert!(swap.is_settled());
        assert_eq!(h.source.balance_of(h.eth, h.user).await, units(10));
        assert_eq!(h.dest.balance_of(h.matic, h.solver).await, units(5_000));
    }

    #[tokio::test]
    async fn test_participant_lock_requires_active_initiator() {
        let h = harness().await;
        let (initiator, participant) = legs(&h);
        let swap = h
            .coordinator
            .initiate_swap(initiator, participant, 3600)
            .await
            .unwrap();
        h.coordinator.lock_initiator_funds(swap.id).await.unwrap();

        h.source.set_time(T0 + 3600).await;
        let err = h
            .coordinator
            .lock_participant_funds(swap.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::StateMismatch { .. }));
        assert_eq!(h.dest.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_initiator_lock_failure_fails_swap() {
        let h = harness().await;
        let (initiator, participant) = legs(&h);
        let swap = h
            .coordinator
            .initiate_swap(initiator, participant, 3600)
            .await
            .unwrap();

        h.source.fail_next_submissions(1).await;
        assert!(h.coordinator.lock_initiator_funds(swap.id).await.is_err());

        let failed = h.coordinator.get_swap(swap.id).await.unwrap();
        assert_eq!(failed.status, SwapStatus::Failed);
        assert!(failed.failure.is_some());
        assert_eq!(failed.initiator.lock_id, None);
        // the submission might still land until the timelock passes
        assert!(failed.initiator.pending_lock.is_some());
        assert!(!failed.is_settled());

        h.source.set_time(T0 + 3600).await;
        assert!(h.coordinator.refund_expired().await.unwrap().is_empty());
        let swap = h.coordinator.get_swap(swap.id).await.unwrap();
        assert_eq!(swap.initiator.pending_lock, None);
        assert!(swap.is_settled());
        assert_eq!(h.source.balance_of(h.eth, h.user).await, units(10));
    }

    #[tokio::test]
    async fn test_refund_expired_sweep() {
        let h = harness().await;
        let id = locked_swap(&h).await;

        assert!(h.coordinator.refund_expired().await.unwrap().is_empty());

        h.source.set_time(T0 + 3600).await;
        h.dest.set_time(T0 + 3600).await;
        let refunded = h.coordinator.refund_expired().await.unwrap();
        assert_eq!(refunded.len(), 2);

        let swap = h.coordinator.get_swap(id).await.unwrap();
        assert_eq!(swap.status, SwapStatus::Refunded);
        assert!(swap.is_settled());
        assert!(h.coordinator.refund_expired().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlocked_swap_expires() {
        let h = harness().await;
        let (initiator, participant) = legs(&h);
        let swap = h
            .coordinator
            .initiate_swap(initiator, participant, 3600)
            .await
            .unwrap();

        h.source.set_time(T0 + 3600).await;
        h.coordinator.refund_expired().await.unwrap();

        let swap = h.coordinator.get_swap(swap.id).await.unwrap();
        assert_eq!(swap.status, SwapStatus::Failed);
        assert!(swap.is_settled());
    }

    #[tokio::test]
    async fn test_nothing_revealed_before_participant_claim() {
        let h = harness().await;
        let id = locked_swap(&h).await;
        assert_eq!(h.coordinator.observe_revealed_secret(id).await.unwrap(), None);
        assert_eq!(h.coordinator.complete_from_chain(id).await.unwrap(), None);
    }

    /// Drops the first escrow read that follows a failed submission
    struct LossyReads {
        inner: Arc<SimulatedChain>,
        drop_next_read: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChainClient for LossyReads {
        fn chain_id(&self) -> u64 {
            self.inner.chain_id()
        }

        async fn submit_transaction(
            &self,
            from: Address,
            call: &EscrowCall,
        ) -> SettlementResult<TxReceipt> {
            let outcome = self.inner.submit_transaction(from, call).await;
            if outcome.is_err() {
                self.drop_next_read.store(true, Ordering::SeqCst);
            }
            outcome
        }

        async fn get_block_timestamp(&self) -> SettlementResult<u64> {
            self.inner.get_block_timestamp().await
        }

        async fn wait_for_confirmation(
            &self,
            tx_hash: H256,
            min_confirmations: u64,
        ) -> SettlementResult<TxReceipt> {
            self.inner
                .wait_for_confirmation(tx_hash, min_confirmations)
                .await
        }

        async fn get_contract(&self, contract_id: H256) -> SettlementResult<OnChainContract> {
            if self.drop_next_read.swap(false, Ordering::SeqCst) {
                return Err(SettlementError::submission(self.chain_id(), "read timed out"));
            }
            self.inner.get_contract(contract_id).await
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_lock_is_adopted_and_refunded() {
        let h = harness().await;
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let lossy = Arc::new(LossyReads {
            inner: h.source.clone(),
            drop_next_read: AtomicBool::new(false),
        });
        let mut managers = HashMap::new();
        managers.insert(
            1,
            Arc::new(HtlcManager::new(lossy, store.clone(), HashAlgorithm::Sha256, 1)),
        );
        managers.insert(
            137,
            Arc::new(HtlcManager::new(
                h.dest.clone(),
                store.clone(),
                HashAlgorithm::Sha256,
                1,
            )),
        );
        let coordinator = SwapCoordinator::new(managers, store, SwapConfig::default()).unwrap();

        let (initiator, participant) = legs(&h);
        let swap = coordinator
            .initiate_swap(initiator, participant, 3600)
            .await
            .unwrap();

        // the lock lands, its response is lost and so is the follow-up read
        h.source.land_then_fail_next(1).await;
        assert!(coordinator.lock_initiator_funds(swap.id).await.is_err());
        assert_eq!(h.source.balance_of(h.eth, h.user).await, units(9));

        let failed = coordinator.get_swap(swap.id).await.unwrap();
        assert_eq!(failed.status, SwapStatus::Failed);
        assert_eq!(failed.initiator.lock_id, None);
        assert!(!failed.is_settled());

        // next sweep finds the escrow
        assert!(coordinator.refund_expired().await.unwrap().is_empty());
        let adopted = coordinator.get_swap(swap.id).await.unwrap();
        assert_eq!(adopted.initiator.lock_id, failed.initiator.pending_lock);
        assert_eq!(adopted.initiator.state, Some(HtlcState::Active));

        h.source.set_time(T0 + 3600).await;
        let refunded = coordinator.refund_expired().await.unwrap();
        assert_eq!(refunded.len(), 1);
        assert_eq!(refunded[0].1, LegRole::Initiator);

        let swap = coordinator.get_swap(swap.id).await.unwrap();
        assert_eq!(swap.status, SwapStatus::Refunded);
        assert!(swap.is_settled());
        assert_eq!(h.source.balance_of(h.eth, h.user).await, units(10));
    }
}

//! Settlement engine: accepted intents in, settled swaps out

use crate::config::EngineConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::htlc::HtlcState;
use crate::intent::{to_base_units, IntentEngine, IntentStatus, PaymentIntent, SolverProposal};
use crate::swap::{AtomicSwap, LegTerms, SwapCoordinator, SwapStatus};

use ethers::types::H256;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one recovery pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub completed: usize,
    pub refunded: usize,
    pub intents_closed: usize,
}

/// Executes accepted intents as atomic swaps and recovers interrupted ones
pub struct SettlementEngine {
    intents: Arc<IntentEngine>,
    swaps: Arc<SwapCoordinator>,
    config: EngineConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl SettlementEngine {
    pub fn new(intents: Arc<IntentEngine>, swaps: Arc<SwapCoordinator>, config: EngineConfig) -> Self {
        Self {
            intents,
            swaps,
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn intents(&self) -> &Arc<IntentEngine> {
        &self.intents
    }

    pub fn swaps(&self) -> &Arc<SwapCoordinator> {
        &self.swaps
    }

    /// Start executing an accepted intent; returns the swap settling it
    ///
    /// An intent executes at most once: a second call fails with
    /// `StateMismatch` and moves no funds.
    pub async fn execute_intent(&self, intent_id: H256) -> SettlementResult<Uuid> {
        let (intent, proposal) = self.intents.begin_execution(intent_id).await?;

        let (initiator, participant) = match plan_legs(&intent, &proposal) {
            Ok(legs) => legs,
            Err(e) => {
                self.intents.mark_failed(intent_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        let swap = match self
            .swaps
            .initiate_swap(initiator, participant, self.config.default_timelock_secs)
            .await
        {
            Ok(swap) => swap,
            Err(e) => {
                self.intents.mark_failed(intent_id, &e.to_string()).await?;
                return Err(e);
            }
        };
        self.swaps.attach_intent(swap.id, intent_id).await?;
        self.intents.attach_swap(intent_id, swap.id).await?;

        info!(
            "Executing intent {:?} as swap {} with solver {:?}",
            intent_id, swap.id, proposal.solver
        );
        Ok(swap.id)
    }

    /// Drive a swap from `initiated` through both locks and both claims
    ///
    /// Errors leave the swap in its last recorded state for recovery.
    pub async fn run_swap(&self, swap_id: Uuid) -> SettlementResult<SwapStatus> {
        self.swaps.lock_initiator_funds(swap_id).await?;
        self.swaps.lock_participant_funds(swap_id).await?;
        match self.swaps.redeem_participant(swap_id).await {
            Ok(_) => {}
            // recovery got there first
            Err(SettlementError::AlreadySettled { .. }) => {}
            Err(e) => return Err(e),
        }

        self.swaps.complete_from_chain(swap_id).await?;
        let status = self.swaps.get_swap(swap_id).await?.status;
        if status != SwapStatus::Completed {
            warn!(
                "Swap {}: participant claim landed but swap is still {}",
                swap_id, status
            );
        }
        Ok(status)
    }

    /// Execute an accepted intent end to end and record the outcome on it
    pub async fn settle_intent(&self, intent_id: H256) -> SettlementResult<SwapStatus> {
        let swap_id = self.execute_intent(intent_id).await?;
        self.finish_swap(swap_id).await
    }

    /// Run a started swap and close its intent with the outcome
    pub async fn finish_swap(&self, swap_id: Uuid) -> SettlementResult<SwapStatus> {
        let outcome = self.run_swap(swap_id).await;

        let swap = self.swaps.get_swap(swap_id).await?;
        self.close_intent(&swap).await?;

        match outcome {
            Ok(status) => Ok(status),
            Err(e) => {
                error!(
                    "Swap {} for intent {:?} stopped: {}",
                    swap_id, swap.intent_id, e
                );
                Err(e)
            }
        }
    }

    /// One recovery pass over every open swap
    pub async fn recover_once(&self) -> SettlementResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let open = self.swaps.open_swaps().await?;

        for swap in open.iter().filter(|s| s.status == SwapStatus::Locked) {
            match self.resume(swap).await {
                Ok(Some(_)) => report.completed += 1,
                Ok(None) => {}
                Err(e) => warn!("Swap {}: resume failed: {}", swap.id, e),
            }
        }

        report.refunded = self.swaps.refund_expired().await?.len();

        for swap in &open {
            let current = match self.swaps.get_swap(swap.id).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Swap {}: reload failed: {}", swap.id, e);
                    continue;
                }
            };
            match self.close_intent(&current).await {
                Ok(true) => report.intents_closed += 1,
                Ok(false) => {}
                Err(e) => warn!("Swap {}: closing intent failed: {}", swap.id, e),
            }
        }

        if report != RecoveryReport::default() {
            info!("Recovery pass: {:?}", report);
        } else {
            debug!("Recovery pass: nothing to do");
        }
        Ok(report)
    }

    /// Main recovery loop
    pub async fn run(&self) -> SettlementResult<()> {
        let mut recovery_interval =
            interval(Duration::from_secs(self.config.recovery_interval_secs.max(1)));

        info!("Settlement engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            recovery_interval.tick().await;
            match self.recover_once().await {
                Ok(_) => crate::metrics::record_recovery_sweep(true),
                Err(e) => {
                    crate::metrics::record_recovery_sweep(false);
                    if e.should_alert() {
                        error!("Recovery pass failed: {}", e);
                    } else {
                        warn!("Recovery pass failed: {}", e);
                    }
                }
            }
        }

        info!("Settlement engine stopped");
        Ok(())
    }

    /// Stop the recovery loop after its current pass
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Settlement engine shutdown initiated");
    }

    /// Continue a locked swap the engine holds the secret for
    async fn resume(&self, swap: &AtomicSwap) -> SettlementResult<Option<H256>> {
        if swap.participant.state == Some(HtlcState::Active) {
            match self.swaps.redeem_participant(swap.id).await {
                Ok(_) => {}
                Err(SettlementError::AlreadySettled { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.swaps.complete_from_chain(swap.id).await
    }

    /// Move the swap's intent to its final status; `true` if it changed
    async fn close_intent(&self, swap: &AtomicSwap) -> SettlementResult<bool> {
        let Some(intent_id) = swap.intent_id else {
            return Ok(false);
        };
        if self.intents.get_intent(intent_id).await?.status != IntentStatus::Executing {
            return Ok(false);
        }

        match swap.status {
            SwapStatus::Completed => self.intents.mark_completed(intent_id).await?,
            SwapStatus::Refunded => {
                self.intents
                    .mark_failed(intent_id, "swap refunded after timelock expiry")
                    .await?
            }
            SwapStatus::Failed => {
                let reason = swap.failure.as_deref().unwrap_or("swap failed");
                self.intents.mark_failed(intent_id, reason).await?
            }
            SwapStatus::Initiated | SwapStatus::Locked => return Ok(false),
        }
        Ok(true)
    }
}

/// The user's input leg and the solver's output leg for an accepted proposal
pub fn plan_legs(
    intent: &PaymentIntent,
    proposal: &SolverProposal,
) -> SettlementResult<(LegTerms, LegTerms)> {
    let params = &intent.params;
    let initiator = LegTerms {
        chain_id: params.input_chain,
        sender: params.signer,
        receiver: proposal.solver,
        token: params.input_token.address,
        amount: to_base_units(params.input_amount, params.input_token.decimals)?,
    };
    let participant = LegTerms {
        chain_id: params.output_chain,
        sender: proposal.solver,
        receiver: params.recipient(),
        token: params.output_token.address,
        amount: to_base_units(proposal.output_amount, params.output_token.decimals)?,
    };
    Ok((initiator, participant))
}

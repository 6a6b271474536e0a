//! Intent lifecycle and proposal book

use super::{
    intent_id, to_base_units, IntentParams, IntentRecord, IntentStatus, PaymentIntent,
    SolverProposal, MAX_TOKEN_DECIMALS,
};
use crate::error::{SettlementError, SettlementResult};
use crate::state::SettlementStore;

use chrono::Utc;
use ethers::types::{Address, Bytes, Signature, H256};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns intent records; all mutations are serialized
///
/// An intent is frozen against cancellation and re-acceptance once its
/// stored status leaves `pending`. Used `(signer, nonce)` pairs live in the
/// store, so a cancelled intent stays unreplayable across restarts.
pub struct IntentEngine {
    store: Arc<dyn SettlementStore>,
    book: Mutex<()>,
}

impl IntentEngine {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self {
            store,
            book: Mutex::new(()),
        }
    }

    /// Verify and register a signed intent
    pub async fn create_intent(
        &self,
        params: IntentParams,
        signature: Bytes,
    ) -> SettlementResult<H256> {
        let signer = format!("{:?}", params.signer);
        let parsed = Signature::try_from(signature.as_ref())
            .map_err(|_| SettlementError::InvalidSignature {
                signer: signer.clone(),
            })?;
        let payload = params.signing_payload()?;
        if parsed.verify(payload, params.signer).is_err() {
            crate::metrics::record_intent("invalid_signature");
            return Err(SettlementError::InvalidSignature { signer });
        }

        let id = intent_id(params.signer, params.nonce, &parsed);
        if params.deadline <= Utc::now().timestamp() {
            return Err(SettlementError::IntentExpired {
                intent_id: format!("{:?}", id),
                deadline: params.deadline,
            });
        }
        validate_amounts(&params)?;

        let _book = self.book.lock().await;
        if !self
            .store
            .reserve_nonce(params.signer, params.nonce, id)
            .await?
        {
            crate::metrics::record_intent("replayed");
            return Err(SettlementError::StateMismatch {
                expected: "unused nonce".to_string(),
                actual: format!("nonce {} of {} already used", params.nonce, signer),
            });
        }

        let record = IntentRecord {
            intent: PaymentIntent {
                id,
                params,
                signature,
                created_at: Utc::now(),
            },
            status: IntentStatus::Pending,
            proposals: Vec::new(),
            accepted_solver: None,
            swap_id: None,
            failure: None,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.put_intent(&record).await {
            let params = &record.intent.params;
            if let Err(release) = self.store.release_nonce(params.signer, params.nonce).await {
                warn!(
                    "Nonce {} of {:?} stays reserved after failed insert: {}",
                    params.nonce, params.signer, release
                );
            }
            return Err(e);
        }

        crate::metrics::record_intent("created");
        info!(
            "Intent {:?} created by {:?}: {} {} on chain {} -> >= {} {} on chain {}",
            id,
            record.intent.params.signer,
            record.intent.params.input_amount,
            record.intent.params.input_token.symbol,
            record.intent.params.input_chain,
            record.intent.params.min_output_amount,
            record.intent.params.output_token.symbol,
            record.intent.params.output_chain
        );
        Ok(id)
    }

    pub async fn get_intent(&self, intent_id: H256) -> SettlementResult<IntentRecord> {
        self.store
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| SettlementError::IntentNotFound(format!("{:?}", intent_id)))
    }

    /// Add a proposal to a pending intent; `false` when its terms are rejected
    pub async fn submit_proposal(
        &self,
        intent_id: H256,
        mut proposal: SolverProposal,
    ) -> SettlementResult<bool> {
        let _book = self.book.lock().await;
        let mut record = self.get_intent(intent_id).await?;

        if let Some(reason) = rejection_reason(&record, &proposal)? {
            crate::metrics::record_proposal("rejected");
            info!(
                "Rejected proposal from {:?} for intent {:?}: {}",
                proposal.solver, intent_id, reason
            );
            return Ok(false);
        }

        proposal.sequence = record.proposals.len() as u64;
        debug!(
            "Proposal #{} from {:?} for intent {:?} (score {})",
            proposal.sequence,
            proposal.solver,
            intent_id,
            proposal.score()
        );
        record.proposals.push(proposal);
        record.updated_at = Utc::now();
        self.store.put_intent(&record).await?;

        crate::metrics::record_proposal("accepted");
        Ok(true)
    }

    /// Proposals by descending score; ties keep submission order
    pub async fn rank_proposals(&self, intent_id: H256) -> SettlementResult<Vec<SolverProposal>> {
        let record = self.get_intent(intent_id).await?;
        Ok(rank(record.proposals))
    }

    /// Select a solver's proposal; `false` if already executed or no such proposal
    pub async fn accept_proposal(&self, intent_id: H256, solver: Address) -> SettlementResult<bool> {
        let _book = self.book.lock().await;
        let mut record = self.get_intent(intent_id).await?;
        if record.status != IntentStatus::Pending {
            warn!(
                "Intent {:?} is {}, ignoring acceptance",
                intent_id, record.status
            );
            return Ok(false);
        }
        if record.intent.params.deadline <= Utc::now().timestamp() {
            info!("Intent {:?} deadline passed, not accepting", intent_id);
            return Ok(false);
        }
        if !record.proposals.iter().any(|p| p.solver == solver) {
            debug!("No proposal from {:?} on intent {:?}", solver, intent_id);
            return Ok(false);
        }

        record.status = IntentStatus::Accepted;
        record.accepted_solver = Some(solver);
        record.updated_at = Utc::now();
        self.store.put_intent(&record).await?;

        crate::metrics::record_intent("accepted");
        info!("Intent {:?} accepted proposal from {:?}", intent_id, solver);
        Ok(true)
    }

    /// Remove a pending intent and its proposals; `false` once executed
    pub async fn cancel_intent(&self, intent_id: H256) -> SettlementResult<bool> {
        let _book = self.book.lock().await;
        let record = self.get_intent(intent_id).await?;
        if record.status != IntentStatus::Pending {
            return Ok(false);
        }
        self.store.delete_intent(intent_id).await?;

        crate::metrics::record_intent("cancelled");
        info!("Intent {:?} cancelled", intent_id);
        Ok(true)
    }

    /// Move an accepted intent to executing, exactly once
    pub async fn begin_execution(
        &self,
        intent_id: H256,
    ) -> SettlementResult<(PaymentIntent, SolverProposal)> {
        let _book = self.book.lock().await;
        let mut record = self.get_intent(intent_id).await?;
        if record.status != IntentStatus::Accepted {
            return Err(SettlementError::StateMismatch {
                expected: IntentStatus::Accepted.to_string(),
                actual: record.status.to_string(),
            });
        }
        let proposal = record
            .accepted_proposal()
            .cloned()
            .ok_or_else(|| SettlementError::Internal(format!(
                "accepted intent {:?} has no selected proposal",
                intent_id
            )))?;

        record.status = IntentStatus::Executing;
        record.updated_at = Utc::now();
        self.store.put_intent(&record).await?;

        crate::metrics::record_intent("executing");
        Ok((record.intent, proposal))
    }

    /// Link the swap settling an executing intent
    pub async fn attach_swap(&self, intent_id: H256, swap_id: Uuid) -> SettlementResult<()> {
        self.update_executing(intent_id, |record| record.swap_id = Some(swap_id))
            .await
    }

    pub async fn mark_completed(&self, intent_id: H256) -> SettlementResult<()> {
        self.update_executing(intent_id, |record| {
            record.status = IntentStatus::Completed;
        })
        .await?;
        crate::metrics::record_intent("completed");
        info!("Intent {:?} completed", intent_id);
        Ok(())
    }

    pub async fn mark_failed(&self, intent_id: H256, reason: &str) -> SettlementResult<()> {
        self.update_executing(intent_id, |record| {
            record.status = IntentStatus::Failed;
            record.failure = Some(reason.to_string());
        })
        .await?;
        crate::metrics::record_intent("failed");
        warn!("Intent {:?} failed: {}", intent_id, reason);
        Ok(())
    }

    async fn update_executing<F>(&self, intent_id: H256, apply: F) -> SettlementResult<()>
    where
        F: FnOnce(&mut IntentRecord),
    {
        let _book = self.book.lock().await;
        let mut record = self.get_intent(intent_id).await?;
        if record.status != IntentStatus::Executing {
            return Err(SettlementError::StateMismatch {
                expected: IntentStatus::Executing.to_string(),
                actual: record.status.to_string(),
            });
        }
        apply(&mut record);
        record.updated_at = Utc::now();
        self.store.put_intent(&record).await
    }
}

fn validate_amounts(params: &IntentParams) -> SettlementResult<()> {
    for (name, value) in [
        ("input_amount", params.input_amount),
        ("min_output_amount", params.min_output_amount),
    ] {
        if value <= Decimal::ZERO {
            return Err(SettlementError::InvalidIntent(format!(
                "{} must be positive",
                name
            )));
        }
    }
    if params.max_fee < Decimal::ZERO {
        return Err(SettlementError::InvalidIntent(
            "max_fee must not be negative".to_string(),
        ));
    }
    for token in [&params.input_token, &params.output_token] {
        if token.decimals > MAX_TOKEN_DECIMALS {
            return Err(SettlementError::InvalidIntent(format!(
                "{} has {} decimals, at most {} supported",
                token.symbol, token.decimals, MAX_TOKEN_DECIMALS
            )));
        }
    }
    to_base_units(params.input_amount, params.input_token.decimals)?;
    to_base_units(params.min_output_amount, params.output_token.decimals)?;
    Ok(())
}

fn rejection_reason(
    record: &IntentRecord,
    proposal: &SolverProposal,
) -> SettlementResult<Option<String>> {
    let params = &record.intent.params;
    let reason = if record.status != IntentStatus::Pending {
        Some(format!("intent is {}", record.status))
    } else if params.deadline <= Utc::now().timestamp() {
        Some("intent deadline passed".to_string())
    } else if proposal.output_amount < params.min_output_amount {
        Some(format!(
            "output {} below minimum {}",
            proposal.output_amount, params.min_output_amount
        ))
    } else if proposal.fee > params.max_fee {
        Some(format!("fee {} above maximum {}", proposal.fee, params.max_fee))
    } else if proposal.fee < Decimal::ZERO {
        Some("negative fee".to_string())
    } else if proposal.reputation > 100 {
        Some(format!("reputation {} out of range", proposal.reputation))
    } else if to_base_units(proposal.output_amount, params.output_token.decimals).is_err() {
        Some(format!(
            "output {} not representable in {}",
            proposal.output_amount, params.output_token.symbol
        ))
    } else if proposal.route.is_empty() {
        Some("empty route".to_string())
    } else if SolverProposal::compute_commitment(
        record.intent.id,
        proposal.solver,
        proposal.output_amount,
        proposal.fee,
        proposal.estimated_time_secs,
        &proposal.route,
    )? != proposal.commitment
    {
        Some("commitment does not match terms".to_string())
    } else {
        None
    };
    Ok(reason)
}

fn rank(mut proposals: Vec<SolverProposal>) -> Vec<SolverProposal> {
    proposals.sort_by_key(|p| p.sequence);
    // stable: equal scores stay in submission order
    proposals.sort_by(|a, b| b.score().cmp(&a.score()));
    proposals
}

//! Intent engine - signed trade requests and competing solver proposals
//!
//! An intent moves `pending -> accepted -> executing -> completed`, or to
//! `failed` when its swap cannot be settled. Cancellation removes a pending
//! intent entirely.

mod engine;

pub use engine::IntentEngine;

use crate::error::{SettlementError, SettlementResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Token on a specific chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

/// Terms the user signs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentParams {
    pub signer: Address,
    pub input_chain: u64,
    pub input_token: TokenInfo,
    pub input_amount: Decimal,
    pub output_chain: u64,
    pub output_token: TokenInfo,
    pub min_output_amount: Decimal,
    pub max_fee: Decimal,
    /// Unix seconds, wall clock
    pub deadline: i64,
    pub nonce: u64,
    /// Receives the output; defaults to the signer
    #[serde(default)]
    pub recipient: Option<Address>,
}

impl IntentParams {
    /// Canonical bytes covered by the EIP-191 signature
    pub fn signing_payload(&self) -> SettlementResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn recipient(&self) -> Address {
        self.recipient.unwrap_or(self.signer)
    }
}

/// A signed intent; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: H256,
    pub params: IntentParams,
    pub signature: Bytes,
    pub created_at: DateTime<Utc>,
}

/// Tokens with more decimals cannot express one whole unit in a U256
pub const MAX_TOKEN_DECIMALS: u8 = 77;

/// `keccak256(signer || nonce || r || s || y_parity)`
///
/// Hashes the recovery bit rather than the raw `v`, so the legacy (27/28)
/// and EIP-155 encodings of one signature yield the same id.
pub fn intent_id(signer: Address, nonce: u64, signature: &Signature) -> H256 {
    let mut packed = Vec::with_capacity(20 + 8 + 65);
    packed.extend_from_slice(signer.as_bytes());
    packed.extend_from_slice(&nonce.to_be_bytes());
    let mut word = [0u8; 32];
    signature.r.to_big_endian(&mut word);
    packed.extend_from_slice(&word);
    signature.s.to_big_endian(&mut word);
    packed.extend_from_slice(&word);
    packed.push(y_parity(signature.v));
    H256::from(keccak256(&packed))
}

fn y_parity(v: u64) -> u8 {
    match v {
        0 | 1 => v as u8,
        27 | 28 => (v - 27) as u8,
        v if v >= 35 => ((v - 35) % 2) as u8,
        // not a valid recovery id; kept distinct from 0 and 1
        other => other.min(u8::MAX as u64) as u8,
    }
}

/// One step of a solver's execution route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RouteHop {
    Transfer {
        chain_id: u64,
        token: Address,
    },
    Swap {
        chain_id: u64,
        venue: String,
        token_in: Address,
        token_out: Address,
    },
    Bridge {
        from_chain: u64,
        to_chain: u64,
        protocol: String,
    },
}

/// A solver's offer against one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverProposal {
    pub solver: Address,
    pub output_amount: Decimal,
    pub fee: Decimal,
    pub estimated_time_secs: u64,
    pub route: Vec<RouteHop>,
    /// Binds the solver to these terms, see `compute_commitment`
    pub commitment: H256,
    /// 0..=100
    pub reputation: u8,
    /// Assigned on acceptance into the intent's book
    #[serde(default)]
    pub sequence: u64,
}

impl SolverProposal {
    /// keccak256 over the intent id and every term of the proposal
    pub fn compute_commitment(
        intent_id: H256,
        solver: Address,
        output_amount: Decimal,
        fee: Decimal,
        estimated_time_secs: u64,
        route: &[RouteHop],
    ) -> SettlementResult<H256> {
        let mut packed = Vec::new();
        packed.extend_from_slice(intent_id.as_bytes());
        packed.extend_from_slice(solver.as_bytes());
        packed.extend_from_slice(output_amount.normalize().to_string().as_bytes());
        packed.push(b'|');
        packed.extend_from_slice(fee.normalize().to_string().as_bytes());
        packed.push(b'|');
        packed.extend_from_slice(&estimated_time_secs.to_be_bytes());
        packed.extend_from_slice(&serde_json::to_vec(route)?);
        Ok(H256::from(keccak256(&packed)))
    }

    /// Build a proposal with its commitment filled in
    pub fn new(
        intent_id: H256,
        solver: Address,
        output_amount: Decimal,
        fee: Decimal,
        estimated_time_secs: u64,
        route: Vec<RouteHop>,
        reputation: u8,
    ) -> SettlementResult<Self> {
        let commitment = Self::compute_commitment(
            intent_id,
            solver,
            output_amount,
            fee,
            estimated_time_secs,
            &route,
        )?;
        Ok(Self {
            solver,
            output_amount,
            fee,
            estimated_time_secs,
            route,
            commitment,
            reputation,
            sequence: 0,
        })
    }

    /// `output_amount - fee + reputation / 100`
    pub fn score(&self) -> Decimal {
        self.output_amount - self.fee + Decimal::from(self.reputation) / Decimal::from(100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Accepted,
    Executing,
    Completed,
    Failed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Accepted => "accepted",
            IntentStatus::Executing => "executing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRecord {
    pub intent: PaymentIntent,
    pub status: IntentStatus,
    /// In submission order
    pub proposals: Vec<SolverProposal>,
    pub accepted_solver: Option<Address>,
    pub swap_id: Option<Uuid>,
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IntentRecord {
    pub fn accepted_proposal(&self) -> Option<&SolverProposal> {
        let solver = self.accepted_solver?;
        self.proposals.iter().find(|p| p.solver == solver)
    }
}

/// Convert a human amount into token base units
pub fn to_base_units(amount: Decimal, decimals: u8) -> SettlementResult<U256> {
    if amount.is_sign_negative() {
        return Err(SettlementError::InvalidIntent(format!(
            "negative amount {}",
            amount
        )));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals as u32 {
        return Err(SettlementError::InvalidIntent(format!(
            "{} has more than {} decimals",
            amount, decimals
        )));
    }
    let mantissa = U256::from(normalized.mantissa().unsigned_abs());
    U256::from(10u8)
        .checked_pow(U256::from(decimals as u32 - scale))
        .and_then(|factor| mantissa.checked_mul(factor))
        .ok_or_else(|| {
            SettlementError::InvalidIntent(format!(
                "{} with {} decimals overflows 256 bits",
                amount, decimals
            ))
        })
}

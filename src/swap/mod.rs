//! Atomic swap coordinator - two escrow legs sharing one secret
//!
//! The initiator locks first with the longer timelock. The participant locks
//! against the same hashlock with a timelock `safety_margin` earlier, so the
//! initiator must reveal the secret (by claiming the participant leg) while
//! the participant still has time to claim the initiator leg with it.

mod coordinator;

pub use coordinator::SwapCoordinator;

use crate::config::EngineConfig;
use crate::hashlock::{HashAlgorithm, Secret};
use crate::htlc::HtlcState;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who funds and who receives one leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegTerms {
    pub chain_id: u64,
    pub sender: Address,
    pub receiver: Address,
    pub token: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    Initiator,
    Participant,
}

impl LegRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegRole::Initiator => "initiator",
            LegRole::Participant => "participant",
        }
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a swap and what is known of its escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLeg {
    pub terms: LegTerms,
    /// Absolute expiry in this leg's chain time
    pub timelock: u64,
    /// Set once the escrow exists on chain
    pub lock_id: Option<H256>,
    /// Contract id of a lock submission whose outcome is not yet known
    #[serde(default)]
    pub pending_lock: Option<H256>,
    pub state: Option<HtlcState>,
    pub settle_tx: Option<H256>,
}

impl SwapLeg {
    fn new(terms: LegTerms, timelock: u64) -> Self {
        Self {
            terms,
            timelock,
            lock_id: None,
            pending_lock: None,
            state: None,
            settle_tx: None,
        }
    }

    /// Escrow exists, or may exist, and neither side has taken the funds
    pub fn holds_funds(&self) -> bool {
        (self.lock_id.is_some() || self.pending_lock.is_some())
            && !self.state.map_or(false, |s| s.is_terminal())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Initiated,
    Locked,
    Completed,
    Refunded,
    Failed,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Initiated => "initiated",
            SwapStatus::Locked => "locked",
            SwapStatus::Completed => "completed",
            SwapStatus::Refunded => "refunded",
            SwapStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Refunded | SwapStatus::Failed
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pairing of two escrow legs under one secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSwap {
    pub id: Uuid,
    /// Intent this swap settles, if any
    #[serde(default)]
    pub intent_id: Option<H256>,
    /// Known only to the initiator until revealed on chain
    pub secret: Secret,
    pub secret_hash: H256,
    pub algorithm: HashAlgorithm,
    pub timelock_duration: u64,
    pub initiator: SwapLeg,
    pub participant: SwapLeg,
    pub status: SwapStatus,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AtomicSwap {
    pub fn leg(&self, role: LegRole) -> &SwapLeg {
        match role {
            LegRole::Initiator => &self.initiator,
            LegRole::Participant => &self.participant,
        }
    }

    pub fn leg_mut(&mut self, role: LegRole) -> &mut SwapLeg {
        match role {
            LegRole::Initiator => &mut self.initiator,
            LegRole::Participant => &mut self.participant,
        }
    }

    /// Terminal status and no escrow left holding funds
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && !self.initiator.holds_funds() && !self.participant.holds_funds()
    }
}

/// Timelock policy shared by every swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapConfig {
    pub safety_margin_secs: u64,
    pub max_chain_skew_secs: u64,
    pub algorithm: HashAlgorithm,
}

impl Default for SwapConfig {
    fn default() -> Self {
        SwapConfig::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SwapConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            safety_margin_secs: config.safety_margin_secs,
            max_chain_skew_secs: config.max_chain_skew_secs,
            algorithm: config.hash_algorithm,
        }
    }
}

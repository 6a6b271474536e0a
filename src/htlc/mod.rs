//! HTLC manager - one escrow leg per lock on a single chain
//!
//! Every legality check (preimage, timelock, settlement state) runs against
//! freshly read chain state before a transaction is submitted.

mod manager;

pub use manager::HtlcManager;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one escrow leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcState {
    Active,
    Redeemed,
    Refunded,
    /// Timelock passed without a claim; refundable
    Expired,
}

impl HtlcState {
    /// Redeemed and refunded are terminal and mutually exclusive
    pub fn is_terminal(&self) -> bool {
        matches!(self, HtlcState::Redeemed | HtlcState::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HtlcState::Active => "active",
            HtlcState::Redeemed => "redeemed",
            HtlcState::Refunded => "refunded",
            HtlcState::Expired => "expired",
        }
    }

    /// Derive the state from the escrow flags and the chain's clock
    pub fn derive(withdrawn: bool, refunded: bool, timelock: u64, chain_now: u64) -> Self {
        if withdrawn {
            HtlcState::Redeemed
        } else if refunded {
            HtlcState::Refunded
        } else if chain_now >= timelock {
            HtlcState::Expired
        } else {
            HtlcState::Active
        }
    }
}

impl fmt::Display for HtlcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terms of a new lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockParams {
    pub hashlock: H256,
    /// Absolute expiry in the chain's block time
    pub timelock: u64,
    pub amount: U256,
    pub sender: Address,
    pub receiver: Address,
    pub token: Address,
}

impl LockParams {
    /// Id the escrow will assign to a lock with these terms
    pub fn contract_id(&self) -> H256 {
        crate::hashlock::escrow_contract_id(
            self.sender,
            self.receiver,
            self.token,
            self.amount,
            self.hashlock,
            self.timelock,
        )
    }
}

/// One escrow leg as last observed on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcContract {
    pub lock_id: H256,
    pub chain_id: u64,
    pub sender: Address,
    pub receiver: Address,
    pub token_address: Address,
    pub amount: U256,
    pub hashlock: H256,
    pub timelock: u64,
    pub state: HtlcState,
    pub preimage: Option<H256>,
    pub lock_tx: Option<H256>,
    pub settle_tx: Option<H256>,
    pub updated_at: DateTime<Utc>,
}

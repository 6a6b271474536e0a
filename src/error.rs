//! Error types for the settlement engine

use thiserror::Error;

/// Main error type for the settlement engine
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid signature for intent signed by {signer}")]
    InvalidSignature { signer: String },

    #[error("Preimage does not match hashlock of lock {lock_id}")]
    InvalidPreimage { lock_id: String },

    #[error("Timelock of lock {lock_id} not expired: chain time {now} < {timelock}")]
    TimelockNotExpired {
        lock_id: String,
        now: u64,
        timelock: u64,
    },

    #[error("Timelock of lock {lock_id} expired: chain time {now} >= {timelock}")]
    TimelockExpired {
        lock_id: String,
        now: u64,
        timelock: u64,
    },

    #[error("Lock {lock_id} already settled ({state})")]
    AlreadySettled { lock_id: String, state: String },

    #[error("Chain submission error on chain {chain_id}: {message}")]
    ChainSubmission {
        chain_id: u64,
        message: String,
        reverted: bool,
    },

    #[error("State mismatch: expected {expected}, found {actual}")]
    StateMismatch { expected: String, actual: String },

    #[error("Intent {0} not found")]
    IntentNotFound(String),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Intent {intent_id} expired at {deadline}")]
    IntentExpired { intent_id: String, deadline: i64 },

    #[error("Swap {0} not found")]
    SwapNotFound(String),

    #[error("Lock {lock_id} not found on chain {chain_id}")]
    LockNotFound { chain_id: u64, lock_id: String },

    #[error("Chain {chain_id} not configured")]
    UnknownChain { chain_id: u64 },

    #[error("Invalid timelock: {0}")]
    InvalidTimelock(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Transient chain failure that did not revert
    pub fn submission(chain_id: u64, message: impl Into<String>) -> Self {
        SettlementError::ChainSubmission {
            chain_id,
            message: message.into(),
            reverted: false,
        }
    }

    /// Transaction mined but reverted by the escrow contract
    pub fn reverted(chain_id: u64, message: impl Into<String>) -> Self {
        SettlementError::ChainSubmission {
            chain_id,
            message: message.into(),
            reverted: true,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlementError::ChainSubmission { reverted: false, .. }
                | SettlementError::Timeout { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SettlementError::StateMismatch { .. }
                | SettlementError::Wallet(_)
                | SettlementError::Database(_)
        )
    }
}

/// Result type for settlement operations
pub type SettlementResult<T> = Result<T, SettlementError>;

//! Intent-based cross-chain settlement engine
//!
//! Users sign intents, solvers compete with proposals, and the accepted
//! proposal settles as an atomic swap between two hash time-locked escrows.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod hashlock;
pub mod htlc;
pub mod intent;
pub mod metrics;
pub mod state;
pub mod swap;
pub mod tx;

pub use error::{SettlementError, SettlementResult};

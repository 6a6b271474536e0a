//! Settlement coordination
//!
//! The settlement engine:
//! 1. Turns an accepted intent into a swap between the user and the solver
//! 2. Drives the swap through both locks and both claims
//! 3. Periodically resumes interrupted swaps and refunds expired legs
//! 4. Records the final outcome on the intent

pub mod engine;

pub use engine::{plan_legs, RecoveryReport, SettlementEngine};

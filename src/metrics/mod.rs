//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health and escrow transactions
//! - HTLC lifecycle transitions
//! - Intent and swap outcomes

use crate::error::{SettlementError, SettlementResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "settlement_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "settlement_transactions_submitted_total",
        "Escrow transactions submitted",
        &["chain_id", "call"]
    ).unwrap();

    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "settlement_retries_total",
        "Retried chain operations",
        &["operation"]
    ).unwrap();

    // HTLC metrics
    pub static ref HTLC_TRANSITIONS: CounterVec = register_counter_vec!(
        "settlement_htlc_transitions_total",
        "HTLC state transitions",
        &["chain_id", "state"]
    ).unwrap();

    // Intent metrics
    pub static ref INTENTS: CounterVec = register_counter_vec!(
        "settlement_intents_total",
        "Intent lifecycle events",
        &["event"]
    ).unwrap();

    pub static ref PROPOSALS: CounterVec = register_counter_vec!(
        "settlement_proposals_total",
        "Solver proposals by outcome",
        &["outcome"]
    ).unwrap();

    // Swap metrics
    pub static ref SWAPS: CounterVec = register_counter_vec!(
        "settlement_swaps_total",
        "Swaps reaching a status",
        &["status"]
    ).unwrap();

    pub static ref SWAP_LATENCY: HistogramVec = register_histogram_vec!(
        "settlement_swap_latency_seconds",
        "Wall-clock time from initiation to completion",
        &["outcome"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
    ).unwrap();

    pub static ref RECOVERY_SWEEPS: CounterVec = register_counter_vec!(
        "settlement_recovery_sweeps_total",
        "Recovery sweeps by result",
        &["result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SettlementResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SettlementError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SettlementError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_tx_submitted(chain_id: u64, call: &str) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), call])
        .inc();
}

pub fn record_retry(operation: &str) {
    RETRIES.with_label_values(&[operation]).inc();
}

pub fn record_htlc_transition(chain_id: u64, state: &str) {
    HTLC_TRANSITIONS
        .with_label_values(&[&chain_id.to_string(), state])
        .inc();
}

pub fn record_intent(event: &str) {
    INTENTS.with_label_values(&[event]).inc();
}

pub fn record_proposal(outcome: &str) {
    PROPOSALS.with_label_values(&[outcome]).inc();
}

pub fn record_swap(status: &str) {
    SWAPS.with_label_values(&[status]).inc();
}

pub fn record_swap_latency(outcome: &str, latency_secs: f64) {
    SWAP_LATENCY
        .with_label_values(&[outcome])
        .observe(latency_secs);
}

pub fn record_recovery_sweep(success: bool) {
    RECOVERY_SWEEPS
        .with_label_values(&[if success { "ok" } else { "error" }])
        .inc();
}

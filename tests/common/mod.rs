#![allow(dead_code)]

use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use intent_settlement::chain::{ChainClient, RetryPolicy, RetryingClient, SimulatedChain};
use intent_settlement::config::EngineConfig;
use intent_settlement::coordination::SettlementEngine;
use intent_settlement::hashlock::HashAlgorithm;
use intent_settlement::htlc::HtlcManager;
use intent_settlement::intent::{IntentEngine, IntentParams, RouteHop, SolverProposal, TokenInfo};
use intent_settlement::state::{MemoryStore, SettlementStore};
use intent_settlement::swap::{SwapConfig, SwapCoordinator};

pub const T0: u64 = 1_700_000_000;
pub const ETH_CHAIN: u64 = 1;
pub const POLYGON_CHAIN: u64 = 137;

pub struct Harness {
    pub source: Arc<SimulatedChain>,
    pub dest: Arc<SimulatedChain>,
    pub store: Arc<dyn SettlementStore>,
    pub intents: Arc<IntentEngine>,
    pub swaps: Arc<SwapCoordinator>,
    pub engine: SettlementEngine,
    pub user: LocalWallet,
    pub solver: Address,
    pub eth: Address,
    pub matic: Address,
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn units(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

/// Two simulated chains, a funded user on the source and a funded solver on the destination
pub async fn harness() -> Harness {
    harness_with(false).await
}

/// Same as `harness`, with every chain client behind the retry decorator
pub async fn harness_with_retries() -> Harness {
    harness_with(true).await
}

async fn harness_with(retrying: bool) -> Harness {
    let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
    let source = Arc::new(SimulatedChain::new(ETH_CHAIN, HashAlgorithm::Sha256, T0));
    let dest = Arc::new(SimulatedChain::new(POLYGON_CHAIN, HashAlgorithm::Sha256, T0));

    let user: LocalWallet = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        .parse()
        .unwrap();
    let solver = Address::repeat_byte(0x50);
    let eth = Address::repeat_byte(0xee);
    let matic = Address::repeat_byte(0x99);
    source.mint(eth, user.address(), units(10)).await;
    dest.mint(matic, solver, units(5_000)).await;

    let mut managers = HashMap::new();
    for chain in [&source, &dest] {
        managers.insert(
            chain.chain_id(),
            Arc::new(HtlcManager::new(
                client(chain, retrying),
                store.clone(),
                HashAlgorithm::Sha256,
                1,
            )),
        );
    }

    let swaps = Arc::new(SwapCoordinator::new(managers, store.clone(), SwapConfig::default()).unwrap());
    let intents = Arc::new(IntentEngine::new(store.clone()));
    let engine = SettlementEngine::new(intents.clone(), swaps.clone(), EngineConfig::default());

    Harness {
        source,
        dest,
        store,
        intents,
        swaps,
        engine,
        user,
        solver,
        eth,
        matic,
    }
}

fn client(chain: &Arc<SimulatedChain>, retrying: bool) -> Arc<dyn ChainClient> {
    if retrying {
        Arc::new(RetryingClient::new(chain.clone(), fast_retries()))
    } else {
        chain.clone()
    }
}

impl Harness {
    /// 1.0 ETH on chain 1 for at least 2000 MATIC on chain 137, fee at most 0.01
    pub fn eth_to_matic(&self, nonce: u64) -> IntentParams {
        IntentParams {
            signer: self.user.address(),
            input_chain: ETH_CHAIN,
            input_token: TokenInfo {
                symbol: "ETH".to_string(),
                address: self.eth,
                decimals: 18,
            },
            input_amount: dec("1.0"),
            output_chain: POLYGON_CHAIN,
            output_token: TokenInfo {
                symbol: "MATIC".to_string(),
                address: self.matic,
                decimals: 18,
            },
            min_output_amount: dec("2000"),
            max_fee: dec("0.01"),
            deadline: Utc::now().timestamp() + 3600,
            nonce,
            recipient: None,
        }
    }

    pub async fn sign(&self, params: &IntentParams) -> Bytes {
        let payload = params.signing_payload().unwrap();
        Bytes::from(self.user.sign_message(payload).await.unwrap().to_vec())
    }

    pub fn proposal(&self, intent_id: H256, solver: Address, output: &str, fee: &str, reputation: u8) -> SolverProposal {
        SolverProposal::new(
            intent_id,
            solver,
            dec(output),
            dec(fee),
            600,
            vec![
                RouteHop::Transfer {
                    chain_id: ETH_CHAIN,
                    token: self.eth,
                },
                RouteHop::Bridge {
                    from_chain: ETH_CHAIN,
                    to_chain: POLYGON_CHAIN,
                    protocol: "htlc".to_string(),
                },
            ],
            reputation,
        )
        .unwrap()
    }

    /// Create the scenario intent and accept the solver's 2100 MATIC proposal
    pub async fn accepted_intent(&self, nonce: u64) -> H256 {
        let params = self.eth_to_matic(nonce);
        let signature = self.sign(&params).await;
        let intent_id = self.intents.create_intent(params, signature).await.unwrap();

        let proposal = self.proposal(intent_id, self.solver, "2100", "0.005", 80);
        assert!(self.intents.submit_proposal(intent_id, proposal).await.unwrap());
        assert!(self.intents.accept_proposal(intent_id, self.solver).await.unwrap());
        intent_id
    }

    pub async fn set_time(&self, timestamp: u64) {
        self.source.set_time(timestamp).await;
        self.dest.set_time(timestamp).await;
    }
}

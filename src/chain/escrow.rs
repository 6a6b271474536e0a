//! ABI of the hash time-locked escrow contract
//!
//! The function signatures below are a fixed wire contract with the deployed
//! escrow; selectors are derived from them and must not drift.

use crate::error::{SettlementError, SettlementResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::{id, keccak256};
use serde::{Deserialize, Serialize};

pub const NEW_CONTRACT_SIG: &str = "newContract(address,bytes32,uint256,address,uint256)";
pub const WITHDRAW_SIG: &str = "withdraw(bytes32,bytes32)";
pub const REFUND_SIG: &str = "refund(bytes32)";
pub const GET_CONTRACT_SIG: &str = "getContract(bytes32)";
pub const NEW_CONTRACT_EVENT_SIG: &str =
    "HTLCERC20New(bytes32,address,address,address,uint256,bytes32,uint256)";

/// State-changing calls on the escrow contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowCall {
    /// Lock `amount` of `token` for `receiver`. `sender` must be the signing
    /// account; the contract itself takes it from `msg.sender`.
    NewContract {
        sender: Address,
        receiver: Address,
        hashlock: H256,
        timelock: u64,
        token: Address,
        amount: U256,
    },
    Withdraw {
        contract_id: H256,
        preimage: H256,
    },
    Refund {
        contract_id: H256,
    },
}

impl EscrowCall {
    /// Name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            EscrowCall::NewContract { .. } => "new_contract",
            EscrowCall::Withdraw { .. } => "withdraw",
            EscrowCall::Refund { .. } => "refund",
        }
    }

    /// ABI-encoded calldata
    pub fn encode(&self) -> Bytes {
        let (signature, tokens) = match self {
            EscrowCall::NewContract {
                receiver,
                hashlock,
                timelock,
                token,
                amount,
                ..
            } => (
                NEW_CONTRACT_SIG,
                vec![
                    Token::Address(*receiver),
                    Token::FixedBytes(hashlock.as_bytes().to_vec()),
                    Token::Uint(U256::from(*timelock)),
                    Token::Address(*token),
                    Token::Uint(*amount),
                ],
            ),
            EscrowCall::Withdraw {
                contract_id,
                preimage,
            } => (
                WITHDRAW_SIG,
                vec![
                    Token::FixedBytes(contract_id.as_bytes().to_vec()),
                    Token::FixedBytes(preimage.as_bytes().to_vec()),
                ],
            ),
            EscrowCall::Refund { contract_id } => (
                REFUND_SIG,
                vec![Token::FixedBytes(contract_id.as_bytes().to_vec())],
            ),
        };

        let mut data = id(signature).to_vec();
        data.extend(abi::encode(&tokens));
        data.into()
    }
}

/// Decoded result of `getContract`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainContract {
    pub sender: Address,
    pub receiver: Address,
    pub token: Address,
    pub amount: U256,
    pub hashlock: H256,
    pub timelock: u64,
    pub withdrawn: bool,
    pub refunded: bool,
    pub preimage: H256,
}

impl OnChainContract {
    /// The escrow returns an all-zero tuple for unknown ids
    pub fn exists(&self) -> bool {
        self.sender != Address::zero()
    }
}

/// Calldata for `getContract(contractId)`
pub fn encode_get_contract(contract_id: H256) -> Bytes {
    let mut data = id(GET_CONTRACT_SIG).to_vec();
    data.extend(abi::encode(&[Token::FixedBytes(
        contract_id.as_bytes().to_vec(),
    )]));
    data.into()
}

/// Decode the 9-tuple returned by `getContract`
pub fn decode_get_contract(data: &[u8]) -> SettlementResult<OnChainContract> {
    let types = [
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::Bool,
        ParamType::Bool,
        ParamType::FixedBytes(32),
    ];
    let tokens = abi::decode(&types, data)
        .map_err(|e| SettlementError::Internal(format!("Malformed getContract output: {}", e)))?;

    let mut it = tokens.into_iter();
    let mut next = || {
        it.next()
            .ok_or_else(|| SettlementError::Internal("Truncated getContract output".to_string()))
    };
    let malformed = |field: &str| SettlementError::Internal(format!("Bad getContract field {}", field));

    let sender = next()?.into_address().ok_or_else(|| malformed("sender"))?;
    let receiver = next()?.into_address().ok_or_else(|| malformed("receiver"))?;
    let token = next()?.into_address().ok_or_else(|| malformed("token"))?;
    let amount = next()?.into_uint().ok_or_else(|| malformed("amount"))?;
    let hashlock = next()?
        .into_fixed_bytes()
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| malformed("hashlock"))?;
    let timelock = next()?.into_uint().ok_or_else(|| malformed("timelock"))?;
    let withdrawn = next()?.into_bool().ok_or_else(|| malformed("withdrawn"))?;
    let refunded = next()?.into_bool().ok_or_else(|| malformed("refunded"))?;
    let preimage = next()?
        .into_fixed_bytes()
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| malformed("preimage"))?;

    if timelock > U256::from(u64::MAX) {
        return Err(malformed("timelock"));
    }

    Ok(OnChainContract {
        sender,
        receiver,
        token,
        amount,
        hashlock,
        timelock: timelock.as_u64(),
        withdrawn,
        refunded,
        preimage,
    })
}

/// Topic0 of the `HTLCERC20New` event
pub fn new_contract_topic() -> H256 {
    H256::from(keccak256(NEW_CONTRACT_EVENT_SIG))
}

/// Pull the contract id out of the escrow's `HTLCERC20New` log
pub fn contract_id_from_logs(logs: &[Log], escrow: Address) -> Option<H256> {
    let topic = new_contract_topic();
    logs.iter()
        .filter(|log| log.address == escrow)
        .find(|log| log.topics.first() == Some(&topic))
        .and_then(|log| log.topics.get(1).copied())
}

//! Hashlock commitments shared by the HTLC manager and the swap coordinator
//!
//! The hash function is part of the wire contract with the deployed escrow:
//! a hashlock is only claimable if the contract computes the same digest over
//! the revealed preimage.

use ethers::types::{Address, H256, U256};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;

/// Digest the escrow contract applies to a preimage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Keccak256,
}

/// 32-byte swap secret (the HTLC preimage)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret(H256);

impl Secret {
    /// Fresh secret from the OS CSPRNG
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(H256::from(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(H256::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_fixed_bytes()
    }

    pub fn to_h256(&self) -> H256 {
        self.0
    }
}

impl From<H256> for Secret {
    fn from(value: H256) -> Self {
        Self(value)
    }
}

// Never print the preimage itself.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Compute the hashlock for a secret
pub fn commit(algorithm: HashAlgorithm, secret: &Secret) -> H256 {
    digest(algorithm, secret.as_bytes())
}

/// Check a candidate preimage against a hashlock
pub fn verify(algorithm: HashAlgorithm, secret: &Secret, hashlock: &H256) -> bool {
    commit(algorithm, secret) == *hashlock
}

fn digest(algorithm: HashAlgorithm, data: &[u8]) -> H256 {
    match algorithm {
        HashAlgorithm::Sha256 => H256::from_slice(&Sha256::digest(data)),
        HashAlgorithm::Keccak256 => H256::from_slice(&Keccak256::digest(data)),
    }
}

/// Contract id the escrow derives for `newContract`:
/// `sha256(abi.encodePacked(sender, receiver, token, amount, hashlock, timelock))`
pub fn escrow_contract_id(
    sender: Address,
    receiver: Address,
    token: Address,
    amount: U256,
    hashlock: H256,
    timelock: u64,
) -> H256 {
    let mut packed = Vec::with_capacity(20 * 3 + 32 * 3);
    packed.extend_from_slice(sender.as_bytes());
    packed.extend_from_slice(receiver.as_bytes());
    packed.extend_from_slice(token.as_bytes());

    let mut word = [0u8; 32];
    amount.to_big_endian(&mut word);
    packed.extend_from_slice(&word);
    packed.extend_from_slice(hashlock.as_bytes());
    U256::from(timelock).to_big_endian(&mut word);
    packed.extend_from_slice(&word);

    H256::from_slice(&Sha256::digest(&packed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let secret = Secret::from_bytes([0u8; 32]);
        let hash = commit(HashAlgorithm::Sha256, &secret);
        assert_eq!(
            hex::encode(hash),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_keccak_known_vector() {
        let secret = Secret::from_bytes([0u8; 32]);
        let hash = commit(HashAlgorithm::Keccak256, &secret);
        assert_eq!(
            hex::encode(hash),
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
    }

    #[test]
    fn test_verify_rejects_other_secret() {
        let secret = Secret::random();
        let other = Secret::random();
        let hash = commit(HashAlgorithm::Sha256, &secret);
        assert!(verify(HashAlgorithm::Sha256, &secret, &hash));
        assert!(!verify(HashAlgorithm::Sha256, &other, &hash));
        assert!(!verify(HashAlgorithm::Keccak256, &secret, &hash));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", secret), "Secret(<redacted>)");
    }

    #[test]
    fn test_contract_id_depends_on_every_field() {
        let base = escrow_contract_id(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            U256::from(1000u64),
            H256::repeat_byte(4),
            3600,
        );
        let later = escrow_contract_id(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            U256::from(1000u64),
            H256::repeat_byte(4),
            3601,
        );
        assert_ne!(base, later);
    }
}

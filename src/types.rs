//! Consensus-facing types: keys, addresses, signatures, votes and proposals.
//!
//! Votes and proposals are signed over their canonical JSON encoding for a
//! given chain id. The signer treats those bytes as opaque.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Width of an Ed25519 public key.
pub const PUBKEY_LEN: usize = 32;

/// Width of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Width of a validator address.
pub const ADDRESS_LEN: usize = 20;

/// Ed25519 public key of the validator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey([u8; PUBKEY_LEN]);

impl PubKey {
    pub fn from_bytes(bytes: [u8; PUBKEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    /// Validator address: the first 20 bytes of SHA-256 over the key.
    pub fn address(&self) -> Address {
        let digest = Sha256::digest(self.0);
        let mut address = [0u8; ADDRESS_LEN];
        address.copy_from_slice(&digest[..ADDRESS_LEN]);
        Address(address)
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Validator address derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode_upper(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// Failure to produce canonical sign bytes.
#[derive(Debug, Error)]
#[error("Failed to encode sign bytes: {0}")]
pub struct SignBytesError(#[from] serde_json::Error);

/// Canonical byte encoding that signers and verifiers agree on.
pub trait SignBytes {
    fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, SignBytesError>;
}

/// Vote step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteType {
    Prevote = 1,
    Precommit = 2,
}

/// A consensus vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    /// Hash of the voted block; `None` for a nil vote
    pub block_hash: Option<[u8; 32]>,
    /// Unix time in milliseconds
    pub timestamp: u64,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: Option<Signature>,
}

#[derive(Serialize)]
struct CanonicalVote<'a> {
    chain_id: &'a str,
    #[serde(rename = "type")]
    vote_type: u8,
    height: u64,
    round: u32,
    block_hash: Option<String>,
    timestamp: u64,
}

impl SignBytes for Vote {
    fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, SignBytesError> {
        let canonical = CanonicalVote {
            chain_id,
            vote_type: self.vote_type as u8,
            height: self.height,
            round: self.round,
            block_hash: self.block_hash.map(hex::encode_upper),
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&canonical)?)
    }
}

/// A block proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    /// Proof-of-lock round, if any
    pub pol_round: Option<u32>,
    pub block_hash: [u8; 32],
    /// Unix time in milliseconds
    pub timestamp: u64,
    pub signature: Option<Signature>,
}

#[derive(Serialize)]
struct CanonicalProposal<'a> {
    chain_id: &'a str,
    height: u64,
    round: u32,
    pol_round: Option<u32>,
    block_hash: String,
    timestamp: u64,
}

impl SignBytes for Proposal {
    fn sign_bytes(&self, chain_id: &str) -> Result<Vec<u8>, SignBytesError> {
        let canonical = CanonicalProposal {
            chain_id,
            height: self.height,
            round: self.round,
            pol_round: self.pol_round,
            block_hash: hex::encode_upper(self.block_hash),
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&canonical)?)
    }
}

//! Vote and proposal payloads and their canonical byte forms.
//!
//! Consensus orders signing decisions by the (height, round, step) triple.
//! The canonical forms are what actually gets hashed and signed: the
//! caller's vote or proposal combined with the chain id, encoded as a
//! length-stable binary payload. The canonical encoding leads with the step
//! so sign bytes can be inspected without knowing their kind up front.

use serde::{Deserialize, Serialize};

use crate::error::SignerError;

pub const STEP_NONE: i8 = 0;
pub const STEP_PROPOSE: i8 = 1;
pub const STEP_PREVOTE: i8 = 2;
pub const STEP_PRECOMMIT: i8 = 3;

/// Hash identifying the block a vote or proposal refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

/// Vote kind within a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    pub fn step(self) -> i8 {
        match self {
            VoteType::Prevote => STEP_PREVOTE,
            VoteType::Precommit => STEP_PRECOMMIT,
        }
    }
}

/// A consensus vote as presented by the node. The signer fills in
/// `signature` and may rewrite `timestamp` on a signature reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: i64,
    pub round: i64,
    pub block_id: BlockId,
    /// UNIX nanoseconds.
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// A block proposal as presented by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: i64,
    pub round: i64,
    pub pol_round: i64,
    pub block_id: BlockId,
    /// UNIX nanoseconds.
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// Canonical form of a vote; these bytes are what gets signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVote {
    /// `STEP_PREVOTE` or `STEP_PRECOMMIT`.
    pub step: i8,
    pub height: i64,
    pub round: i64,
    pub block_id: BlockId,
    pub timestamp: u64,
    pub chain_id: String,
}

/// Canonical form of a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProposal {
    /// Always `STEP_PROPOSE`.
    pub step: i8,
    pub height: i64,
    pub round: i64,
    pub pol_round: i64,
    pub block_id: BlockId,
    pub timestamp: u64,
    pub chain_id: String,
}

pub fn canonicalize_vote(chain_id: &str, vote: &Vote) -> CanonicalVote {
    CanonicalVote {
        step: vote.vote_type.step(),
        height: vote.height,
        round: vote.round,
        block_id: vote.block_id,
        timestamp: vote.timestamp,
        chain_id: chain_id.to_string(),
    }
}

pub fn canonicalize_proposal(chain_id: &str, proposal: &Proposal) -> CanonicalProposal {
    CanonicalProposal {
        step: STEP_PROPOSE,
        height: proposal.height,
        round: proposal.round,
        pol_round: proposal.pol_round,
        block_id: proposal.block_id,
        timestamp: proposal.timestamp,
        chain_id: chain_id.to_string(),
    }
}

/// Sign bytes for a vote.
pub fn vote_sign_bytes(chain_id: &str, vote: &Vote) -> Result<Vec<u8>, SignerError> {
    Ok(bincode::serialize(&canonicalize_vote(chain_id, vote))?)
}

/// Sign bytes for a proposal.
pub fn proposal_sign_bytes(chain_id: &str, proposal: &Proposal) -> Result<Vec<u8>, SignerError> {
    Ok(bincode::serialize(&canonicalize_proposal(
        chain_id, proposal,
    ))?)
}

pub fn decode_canonical_vote(bytes: &[u8]) -> Result<CanonicalVote, SignerError> {
    let vote: CanonicalVote = bincode::deserialize(bytes)?;
    if vote.step != STEP_PREVOTE && vote.step != STEP_PRECOMMIT {
        return Err(SignerError::Decode(format!(
            "canonical vote carries step {}",
            vote.step
        )));
    }
    Ok(vote)
}

pub fn decode_canonical_proposal(bytes: &[u8]) -> Result<CanonicalProposal, SignerError> {
    let proposal: CanonicalProposal = bincode::deserialize(bytes)?;
    if proposal.step != STEP_PROPOSE {
        return Err(SignerError::Decode(format!(
            "canonical proposal carries step {}",
            proposal.step
        )));
    }
    Ok(proposal)
}

/// Extracts (height, round, step) from sign bytes of unknown kind.
///
/// Tries the vote form first, then the proposal form.
pub fn unpack_hrs(sign_bytes: &[u8]) -> Result<(i64, i64, i8), SignerError> {
    if let Ok(vote) = decode_canonical_vote(sign_bytes) {
        return Ok((vote.height, vote.round, vote.step));
    }
    if let Ok(proposal) = decode_canonical_proposal(sign_bytes) {
        return Ok((proposal.height, proposal.round, proposal.step));
    }
    Err(SignerError::Decode(
        "sign bytes are neither a canonical vote nor a canonical proposal".to_string(),
    ))
}

/// Compares two canonical vote payloads with their timestamps normalized
/// out. Returns the stored payload's timestamp and whether the payloads are
/// otherwise bit-for-bit identical.
pub fn vote_only_differ_by_timestamp(
    last_sign_bytes: &[u8],
    new_sign_bytes: &[u8],
) -> Result<(u64, bool), SignerError> {
    let mut last = decode_canonical_vote(last_sign_bytes)?;
    let mut new = decode_canonical_vote(new_sign_bytes)?;

    let last_timestamp = last.timestamp;
    last.timestamp = 0;
    new.timestamp = 0;

    let equal = bincode::serialize(&last)? == bincode::serialize(&new)?;
    Ok((last_timestamp, equal))
}

/// Proposal counterpart of [`vote_only_differ_by_timestamp`].
pub fn proposal_only_differ_by_timestamp(
    last_sign_bytes: &[u8],
    new_sign_bytes: &[u8],
) -> Result<(u64, bool), SignerError> {
    let mut last = decode_canonical_proposal(last_sign_bytes)?;
    let mut new = decode_canonical_proposal(new_sign_bytes)?;

    let last_timestamp = last.timestamp;
    last.timestamp = 0;
    new.timestamp = 0;

    let equal = bincode::serialize(&last)? == bincode::serialize(&new)?;
    Ok((last_timestamp, equal))
}

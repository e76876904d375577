//! Validator signing capabilities.
//!
//! A validator exposes exactly three operations: get-pubkey, sign-vote and
//! sign-proposal. `SingleSigner` holds the Ed25519 key locally; the
//! threshold variant lives in [`crate::threshold`]. Every deployment wraps
//! its validator in a [`PvGuard`] so no two operations ever run
//! concurrently: the check-then-commit against the sign state is only
//! atomic under that gate.

use ed25519_dalek::{Signer, SigningKey};
use std::sync::Mutex;

use crate::canonical::{self, Proposal, Vote, STEP_PROPOSE};
use crate::error::SignerError;
use crate::sign_state::SignState;

/// Capability set the remote signer service talks to.
pub trait ValidatorSigner: Send {
    fn public_key(&self) -> Result<Vec<u8>, SignerError>;

    /// Signs a vote in place. On a timestamp-only replay the vote is
    /// rewritten to carry the originally signed timestamp so the returned
    /// signature stays byte-identical.
    fn sign_vote(&self, vote: &mut Vote) -> Result<(), SignerError>;

    /// Signs a proposal in place, with the same replay behavior as
    /// [`ValidatorSigner::sign_vote`].
    fn sign_proposal(&self, proposal: &mut Proposal) -> Result<(), SignerError>;
}

/// Single-key validator: the simplest signer.
pub struct SingleSigner {
    signing_key: SigningKey,
    chain_id: String,
    sign_state: Mutex<SignState>,
}

impl SingleSigner {
    pub fn new(signing_key: SigningKey, chain_id: String, sign_state: SignState) -> Self {
        SingleSigner {
            signing_key,
            chain_id,
            sign_state: Mutex::new(sign_state),
        }
    }

    fn sign_payload(
        &self,
        height: i64,
        round: i64,
        step: i8,
        sign_bytes: &[u8],
    ) -> Result<(Vec<u8>, Option<u64>), SignerError> {
        let mut state = self.sign_state.lock().unwrap();
        if let Some((signature, last_timestamp)) =
            state.check_payload(height, round, step, sign_bytes)?
        {
            return Ok((signature, Some(last_timestamp)));
        }

        let signature = self.signing_key.sign(sign_bytes).to_bytes().to_vec();
        state.commit(height, round, step, &[], &signature, sign_bytes)?;
        Ok((signature, None))
    }
}

impl ValidatorSigner for SingleSigner {
    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        Ok(self.signing_key.verifying_key().as_bytes().to_vec())
    }

    fn sign_vote(&self, vote: &mut Vote) -> Result<(), SignerError> {
        let sign_bytes = canonical::vote_sign_bytes(&self.chain_id, vote)?;
        let (signature, reused_timestamp) =
            self.sign_payload(vote.height, vote.round, vote.vote_type.step(), &sign_bytes)?;
        if let Some(timestamp) = reused_timestamp {
            vote.timestamp = timestamp;
        }
        vote.signature = signature;
        Ok(())
    }

    fn sign_proposal(&self, proposal: &mut Proposal) -> Result<(), SignerError> {
        let sign_bytes = canonical::proposal_sign_bytes(&self.chain_id, proposal)?;
        let (signature, reused_timestamp) =
            self.sign_payload(proposal.height, proposal.round, STEP_PROPOSE, &sign_bytes)?;
        if let Some(timestamp) = reused_timestamp {
            proposal.timestamp = timestamp;
        }
        proposal.signature = signature;
        Ok(())
    }
}

/// Mutual-exclusion gate in front of a validator. All public validator
/// operations flow through this; handles are shared by borrow, never
/// cloned.
pub struct PvGuard {
    inner: Mutex<Box<dyn ValidatorSigner>>,
}

impl PvGuard {
    pub fn new(validator: Box<dyn ValidatorSigner>) -> Self {
        PvGuard {
            inner: Mutex::new(validator),
        }
    }
}

impl ValidatorSigner for PvGuard {
    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        self.inner.lock().unwrap().public_key()
    }

    fn sign_vote(&self, vote: &mut Vote) -> Result<(), SignerError> {
        self.inner.lock().unwrap().sign_vote(vote)
    }

    fn sign_proposal(&self, proposal: &mut Proposal) -> Result<(), SignerError> {
        self.inner.lock().unwrap().sign_proposal(proposal)
    }
}

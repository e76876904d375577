//! Threshold validator: assembles signatures from a cosigner quorum.
//!
//! A sign request runs in two fan-out phases. Phase 1 collects every
//! cosigner's ephemeral dealings and delivers them within a
//! deterministically chosen quorum (the first m complete dealers by
//! ascending ID, so reruns for the same HRS query the same peers). Phase 2
//! collects partial signatures from that quorum, which are combined,
//! verified under the aggregate key and committed to the validator sign
//! state before the signature is released. Each phase awaits all of its
//! peer calls before the round proceeds; timed-out peers are dropped for
//! the round, never retried within it.

use curve25519_dalek::scalar::Scalar;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use crate::canonical::{self, Proposal, Vote};
use crate::cosigner::{Cosigner, EphemeralSecretPart, LocalCosigner, PartialSignature};
use crate::error::SignerError;
use crate::shares;
use crate::sign_state::SignState;
use crate::validator::ValidatorSigner;

/// Orchestrator for m-of-n signing.
pub struct ThresholdSigner {
    public_key: [u8; 32],
    threshold: u8,
    chain_id: String,
    /// All cosigners including the local one, indexed by ID - 1.
    cosigners: Vec<Arc<dyn Cosigner>>,
    sign_state: Mutex<SignState>,
}

impl ThresholdSigner {
    pub fn new(
        local: Arc<LocalCosigner>,
        peers: Vec<Arc<dyn Cosigner>>,
        chain_id: String,
        sign_state: SignState,
    ) -> Result<Self, SignerError> {
        let public_key = local.public_key();
        let threshold = local.threshold();
        let total = local.total() as usize;

        let mut cosigners: Vec<Arc<dyn Cosigner>> = Vec::with_capacity(total);
        cosigners.push(local);
        cosigners.extend(peers);
        cosigners.sort_by_key(|cosigner| cosigner.id());

        if cosigners.len() != total {
            return Err(SignerError::Config(format!(
                "expected {} cosigners, have {}",
                total,
                cosigners.len()
            )));
        }
        for (index, cosigner) in cosigners.iter().enumerate() {
            if cosigner.id() as usize != index + 1 {
                return Err(SignerError::Config(format!(
                    "cosigner ids must cover 1..={total} exactly, found id {}",
                    cosigner.id()
                )));
            }
        }

        Ok(ThresholdSigner {
            public_key,
            threshold,
            chain_id,
            cosigners,
            sign_state: Mutex::new(sign_state),
        })
    }

    fn cosigner_by_id(&self, id: u8) -> Arc<dyn Cosigner> {
        // IDs cover 1..=n, validated at construction.
        Arc::clone(&self.cosigners[id as usize - 1])
    }

    /// Phase 1a: ask every cosigner for its shares destined for every other
    /// peer, concurrently. A dealer counts only if all of its dealings
    /// succeed.
    fn collect_dealings(
        &self,
        height: i64,
        round: i64,
        step: i8,
    ) -> BTreeMap<u8, Vec<EphemeralSecretPart>> {
        let peer_ids: Vec<u8> = self.cosigners.iter().map(|cosigner| cosigner.id()).collect();
        let dealings = Mutex::new(BTreeMap::new());
        thread::scope(|scope| {
            let dealings = &dealings;
            let peer_ids = &peer_ids;
            for cosigner in &self.cosigners {
                let cosigner = Arc::clone(cosigner);
                scope.spawn(move || {
                    let dealer_id = cosigner.id();
                    let mut parts = Vec::new();
                    for &destination in peer_ids {
                        if destination == dealer_id {
                            continue;
                        }
                        match cosigner.get_ephemeral_secret_part(height, round, step, destination)
                        {
                            Ok(part) => parts.push(part),
                            Err(err) => {
                                warn!(
                                    "dropping cosigner {} for this round: dealing for {} failed: {}",
                                    dealer_id, destination, err
                                );
                                return;
                            }
                        }
                    }
                    dealings.lock().unwrap().insert(dealer_id, parts);
                });
            }
        });
        dealings.into_inner().unwrap()
    }

    /// Phase 1b: deliver the quorum's dealings to each quorum member.
    /// Returns the members that received every share.
    fn deliver_dealings(
        &self,
        quorum: &[u8],
        dealings: &BTreeMap<u8, Vec<EphemeralSecretPart>>,
    ) -> Vec<u8> {
        let delivered = Mutex::new(Vec::new());
        thread::scope(|scope| {
            let delivered = &delivered;
            for &receiver_id in quorum {
                let receiver = self.cosigner_by_id(receiver_id);
                let parts: Vec<EphemeralSecretPart> = quorum
                    .iter()
                    .filter(|&&dealer_id| dealer_id != receiver_id)
                    .filter_map(|dealer_id| dealings.get(dealer_id))
                    .flat_map(|parts| {
                        parts
                            .iter()
                            .filter(|part| part.destination_id == receiver_id)
                            .cloned()
                    })
                    .collect();
                scope.spawn(move || {
                    for part in parts {
                        let source_id = part.source_id;
                        if let Err(err) = receiver.set_ephemeral_secret_part(part) {
                            warn!(
                                "dropping cosigner {} for this round: delivery from {} failed: {}",
                                receiver_id, source_id, err
                            );
                            return;
                        }
                    }
                    delivered.lock().unwrap().push(receiver_id);
                });
            }
        });
        let mut delivered = delivered.into_inner().unwrap();
        delivered.sort_unstable();
        delivered
    }

    /// Phase 2: collect partial signatures from the quorum.
    fn collect_partials(&self, quorum: &[u8], sign_bytes: &[u8]) -> Vec<PartialSignature> {
        let partials = Mutex::new(Vec::new());
        thread::scope(|scope| {
            let partials = &partials;
            for &id in quorum {
                let cosigner = self.cosigner_by_id(id);
                scope.spawn(move || match cosigner.sign_partial(sign_bytes) {
                    Ok(partial) => partials.lock().unwrap().push(partial),
                    Err(err) => warn!("cosigner {} produced no partial: {}", id, err),
                });
            }
        });
        let mut partials = partials.into_inner().unwrap();
        partials.sort_by_key(|partial| partial.source_id);
        partials
    }

    fn sign_payload(&self, sign_bytes: &[u8]) -> Result<(Vec<u8>, Option<u64>), SignerError> {
        let (height, round, step) = canonical::unpack_hrs(sign_bytes)?;

        {
            let state = self.sign_state.lock().unwrap();
            if let Some((signature, last_timestamp)) =
                state.check_payload(height, round, step, sign_bytes)?
            {
                debug!(
                    "reusing assembled signature for height {} round {} step {}",
                    height, round, step
                );
                return Ok((signature, Some(last_timestamp)));
            }
        }

        let need = self.threshold as usize;

        let dealings = self.collect_dealings(height, round, step);
        if dealings.len() < need {
            return Err(SignerError::InsufficientCosigners {
                got: dealings.len(),
                need,
            });
        }
        let quorum: Vec<u8> = dealings.keys().copied().take(need).collect();

        let delivered = self.deliver_dealings(&quorum, &dealings);
        if delivered.len() < need {
            return Err(SignerError::InsufficientCosigners {
                got: delivered.len(),
                need,
            });
        }

        let partials = self.collect_partials(&quorum, sign_bytes);
        if partials.len() < need {
            return Err(SignerError::InsufficientCosigners {
                got: partials.len(),
                need,
            });
        }

        // Every participant must derive the same combined ephemeral public.
        if partials
            .iter()
            .any(|partial| partial.ephemeral_public != partials[0].ephemeral_public)
        {
            return Err(SignerError::Crypto(
                "quorum disagrees on the combined ephemeral public".to_string(),
            ));
        }
        let ephemeral_public: [u8; 32] = partials[0]
            .ephemeral_public
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::Crypto("combined ephemeral public is not 32 bytes".to_string()))?;

        let partial_scalars: Vec<(u8, Scalar)> = partials
            .iter()
            .map(|partial| -> Result<(u8, Scalar), SignerError> {
                Ok((
                    partial.source_id,
                    shares::scalar_from_bytes(&partial.signature)?,
                ))
            })
            .collect::<Result<_, _>>()?;
        let combined = shares::combine_shares(&partial_scalars);
        let signature = shares::assemble_signature(&ephemeral_public, combined);

        // A combined signature that does not verify must never leave the
        // process.
        shares::verify_signature(&self.public_key, sign_bytes, &signature)?;

        let mut state = self.sign_state.lock().unwrap();
        // The round is abandoned if the state advanced while we were
        // fanning out.
        if let Some((cached, last_timestamp)) =
            state.check_payload(height, round, step, sign_bytes)?
        {
            return Ok((cached, Some(last_timestamp)));
        }
        state.commit(
            height,
            round,
            step,
            &ephemeral_public,
            &signature,
            sign_bytes,
        )?;
        info!(
            "assembled threshold signature at height {} round {} step {} with quorum {:?}",
            height, round, step, quorum
        );
        Ok((signature.to_vec(), None))
    }
}

impl ValidatorSigner for ThresholdSigner {
    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        Ok(self.public_key.to_vec())
    }

    fn sign_vote(&self, vote: &mut Vote) -> Result<(), SignerError> {
        let sign_bytes = canonical::vote_sign_bytes(&self.chain_id, vote)?;
        let (signature, reused_timestamp) = self.sign_payload(&sign_bytes)?;
        if let Some(timestamp) = reused_timestamp {
            vote.timestamp = timestamp;
        }
        vote.signature = signature;
        Ok(())
    }

    fn sign_proposal(&self, proposal: &mut Proposal) -> Result<(), SignerError> {
        let sign_bytes = canonical::proposal_sign_bytes(&self.chain_id, proposal)?;
        let (signature, reused_timestamp) = self.sign_payload(&sign_bytes)?;
        if let Some(timestamp) = reused_timestamp {
            proposal.timestamp = timestamp;
        }
        proposal.signature = signature;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{BlockId, VoteType, STEP_PREVOTE};
    use crate::error::DoubleSignError;
    use crate::key::deal_cosigner_keys;
    use crate::sign_state::{load_or_create_sign_state, load_sign_state};
    use tempfile::TempDir;

    /// A peer that never answers; stands in for an unreachable machine.
    struct OfflineCosigner {
        id: u8,
    }

    impl Cosigner for OfflineCosigner {
        fn id(&self) -> u8 {
            self.id
        }

        fn get_ephemeral_secret_part(
            &self,
            _height: i64,
            _round: i64,
            _step: i8,
            _destination_id: u8,
        ) -> Result<EphemeralSecretPart, SignerError> {
            Err(SignerError::CosignerUnavailable {
                id: self.id,
                reason: "offline".to_string(),
            })
        }

        fn set_ephemeral_secret_part(&self, _part: EphemeralSecretPart) -> Result<(), SignerError> {
            Err(SignerError::CosignerUnavailable {
                id: self.id,
                reason: "offline".to_string(),
            })
        }

        fn sign_partial(&self, _sign_bytes: &[u8]) -> Result<PartialSignature, SignerError> {
            Err(SignerError::CosignerUnavailable {
                id: self.id,
                reason: "offline".to_string(),
            })
        }
    }

    fn share_state_path(dir: &TempDir, id: u8) -> std::path::PathBuf {
        dir.path().join(format!("share_state_{id}.json"))
    }

    /// Builds a 2-of-3 cluster with cosigner 1 local; `offline` peers are
    /// replaced by stubs that never answer.
    fn test_cluster(offline: &[u8]) -> (ThresholdSigner, [u8; 32], TempDir) {
        let dir = TempDir::new().unwrap();
        let (public_key, keys) = deal_cosigner_keys(2, 3, 1024).unwrap();

        let mut local = None;
        let mut peers: Vec<Arc<dyn Cosigner>> = Vec::new();
        for key in keys {
            let id = key.id;
            if offline.contains(&id) {
                peers.push(Arc::new(OfflineCosigner { id }));
                continue;
            }
            let state = load_or_create_sign_state(share_state_path(&dir, id)).unwrap();
            let cosigner = Arc::new(LocalCosigner::new(key, state, 2).unwrap());
            if id == 1 {
                local = Some(cosigner);
            } else {
                peers.push(cosigner);
            }
        }

        let validator_state =
            load_or_create_sign_state(dir.path().join("validator_state.json")).unwrap();
        let signer = ThresholdSigner::new(
            local.unwrap(),
            peers,
            "test-chain".to_string(),
            validator_state,
        )
        .unwrap();
        (signer, public_key, dir)
    }

    fn test_vote(height: i64, round: i64, block_byte: u8) -> Vote {
        let mut hash = [0u8; 32];
        hash[0] = block_byte;
        Vote {
            vote_type: VoteType::Prevote,
            height,
            round,
            block_id: BlockId(hash),
            timestamp: 1_000,
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_quorum_signs_with_one_peer_offline() {
        let (signer, public_key, dir) = test_cluster(&[3]);
        let mut vote = test_vote(100, 0, 1);

        signer.sign_vote(&mut vote).unwrap();

        let sign_bytes = canonical::vote_sign_bytes("test-chain", &vote).unwrap();
        shares::verify_signature(&public_key, &sign_bytes, &vote.signature).unwrap();

        // Both participating cosigners advanced their share watermark.
        for id in [1u8, 2] {
            let share_state = load_sign_state(share_state_path(&dir, id)).unwrap();
            assert_eq!(
                (share_state.height, share_state.round, share_state.step),
                (100, 0, STEP_PREVOTE)
            );
        }
        // And the validator state holds the assembled signature.
        let validator_state = load_sign_state(dir.path().join("validator_state.json")).unwrap();
        assert_eq!(validator_state.height, 100);
        assert_eq!(validator_state.signature, vote.signature);
    }

    #[test]
    fn test_quorum_loss_returns_error_and_keeps_state() {
        let (signer, _, dir) = test_cluster(&[2, 3]);
        let mut vote = test_vote(100, 0, 1);

        let err = signer.sign_vote(&mut vote).unwrap_err();
        assert!(matches!(
            err,
            SignerError::InsufficientCosigners { got: 1, need: 2 }
        ));

        // Nothing advanced: not the validator state, not the share state.
        let validator_state = load_sign_state(dir.path().join("validator_state.json")).unwrap();
        assert_eq!(validator_state.height, 0);
        assert_eq!(validator_state.step, 0);
        let share_state = load_sign_state(share_state_path(&dir, 1)).unwrap();
        assert_eq!(share_state.height, 0);
    }

    #[test]
    fn test_quorum_is_deterministic() {
        let (signer, _, dir) = test_cluster(&[]);
        let mut vote = test_vote(100, 0, 1);
        signer.sign_vote(&mut vote).unwrap();

        // All three peers were healthy; the two lowest IDs were chosen.
        for id in [1u8, 2] {
            let share_state = load_sign_state(share_state_path(&dir, id)).unwrap();
            assert_eq!(share_state.height, 100);
        }
        let bystander = load_sign_state(share_state_path(&dir, 3)).unwrap();
        assert_eq!(bystander.height, 0);
    }

    #[test]
    fn test_replay_reuses_signature_and_timestamp() {
        let (signer, _, _dir) = test_cluster(&[3]);

        let mut first = test_vote(100, 0, 1);
        signer.sign_vote(&mut first).unwrap();

        let mut replay = test_vote(100, 0, 1);
        replay.timestamp = 9_999;
        signer.sign_vote(&mut replay).unwrap();

        assert_eq!(replay.signature, first.signature);
        assert_eq!(replay.timestamp, first.timestamp);
    }

    #[test]
    fn test_conflicting_vote_refused() {
        let (signer, _, _dir) = test_cluster(&[3]);

        let mut first = test_vote(100, 0, 1);
        signer.sign_vote(&mut first).unwrap();

        let mut conflicting = test_vote(100, 0, 2);
        let err = signer.sign_vote(&mut conflicting).unwrap_err();
        assert!(matches!(
            err,
            SignerError::DoubleSign(DoubleSignError::ConflictingPayload { .. })
        ));
    }

    #[test]
    fn test_regression_refused() {
        let (signer, _, _dir) = test_cluster(&[3]);

        let mut vote = test_vote(100, 0, 1);
        signer.sign_vote(&mut vote).unwrap();

        let mut stale = test_vote(99, 0, 1);
        let err = signer.sign_vote(&mut stale).unwrap_err();
        assert!(matches!(
            err,
            SignerError::DoubleSign(DoubleSignError::HeightRegression { .. })
        ));
    }

    #[test]
    fn test_consecutive_heights() {
        let (signer, public_key, _dir) = test_cluster(&[3]);

        for height in 100..103 {
            let mut vote = test_vote(height, 0, 1);
            signer.sign_vote(&mut vote).unwrap();
            let sign_bytes = canonical::vote_sign_bytes("test-chain", &vote).unwrap();
            shares::verify_signature(&public_key, &sign_bytes, &vote.signature).unwrap();
        }
    }
}

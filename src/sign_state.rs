//! Persistent high-watermark state for double-sign protection.
//!
//! One `SignState` file exists per signing role: the validator keeps one for
//! the assembled signature, and in threshold mode each cosigner keeps one
//! for its own share contributions. The watermark is the last
//! (height, round, step) signed for; signing never goes backwards, and a
//! repeat of the same triple is only answered from the recorded signature.
//!
//! A signature must never be released before the state recording it has
//! been durably persisted, so `commit` writes through a temp file, fsyncs
//! and renames before returning.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::canonical::{self, STEP_PRECOMMIT, STEP_PREVOTE, STEP_PROPOSE};
use crate::encoding;
use crate::error::{DoubleSignError, SignerError};

/// Result of checking a requested (height, round, step) against the
/// watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrsCheck {
    /// The request is strictly ahead of the watermark.
    Fresh,
    /// The request matches the watermark exactly and a payload is recorded;
    /// the stored signature may be reused if the payloads agree.
    SameHrs,
}

/// High-watermark signing state, persisted as pretty-printed JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignState {
    pub height: i64,
    pub round: i64,
    pub step: i8,
    /// Public part of the ephemeral nonce used for the watermark signature.
    #[serde(with = "encoding::b64", default)]
    pub ephemeral_public: Vec<u8>,
    /// Signature produced for the watermark payload; empty iff step is 0.
    #[serde(with = "encoding::b64", default)]
    pub signature: Vec<u8>,
    /// Exact canonical bytes that were signed.
    #[serde(rename = "signbytes", with = "encoding::hexstring", default)]
    pub sign_bytes: Vec<u8>,
    #[serde(skip)]
    file_path: Option<PathBuf>,
}

impl SignState {
    /// Checks a requested HRS against the watermark.
    ///
    /// Panics if the state records sign bytes without a signature; that can
    /// only come from a corrupted file and continuing would risk
    /// equivocation.
    pub fn check_hrs(&self, height: i64, round: i64, step: i8) -> Result<HrsCheck, DoubleSignError> {
        if self.height > height {
            return Err(DoubleSignError::HeightRegression {
                got: height,
                last: self.height,
            });
        }
        if self.height == height {
            if self.round > round {
                return Err(DoubleSignError::RoundRegression {
                    height,
                    got: round,
                    last: self.round,
                });
            }
            if self.round == round {
                if self.step > step {
                    return Err(DoubleSignError::StepRegression {
                        height,
                        round,
                        got: step,
                        last: self.step,
                    });
                }
                if self.step == step {
                    if self.sign_bytes.is_empty() {
                        return Err(DoubleSignError::MissingPayload {
                            height,
                            round,
                            step,
                        });
                    }
                    if self.signature.is_empty() {
                        panic!(
                            "sign state corrupt: sign bytes recorded for height {} round {} step {} but no signature",
                            height, round, step
                        );
                    }
                    return Ok(HrsCheck::SameHrs);
                }
            }
        }
        Ok(HrsCheck::Fresh)
    }

    /// Compares candidate sign bytes against the stored payload with both
    /// timestamps normalized out. Returns the stored payload's timestamp
    /// and whether the payloads are otherwise identical.
    ///
    /// Panics if the stored bytes cannot be decoded for the recorded step;
    /// a watermark whose payload is unreadable cannot be trusted.
    pub fn only_differ_by_timestamp(&self, new_sign_bytes: &[u8]) -> (u64, bool) {
        let compared = match self.step {
            STEP_PROPOSE => {
                canonical::proposal_only_differ_by_timestamp(&self.sign_bytes, new_sign_bytes)
            }
            STEP_PREVOTE | STEP_PRECOMMIT => {
                canonical::vote_only_differ_by_timestamp(&self.sign_bytes, new_sign_bytes)
            }
            _ => return (0, false),
        };
        match compared {
            Ok(result) => result,
            Err(err) => panic!(
                "sign state corrupt: stored sign bytes for step {} cannot be decoded: {}",
                self.step, err
            ),
        }
    }

    /// Full admission check for candidate sign bytes: `Ok(None)` means the
    /// request is fresh and may be signed; `Ok(Some((signature, last_ts)))`
    /// means the stored signature must be reused together with the stored
    /// payload's timestamp; any other case is a double-sign risk.
    pub fn check_payload(
        &self,
        height: i64,
        round: i64,
        step: i8,
        sign_bytes: &[u8],
    ) -> Result<Option<(Vec<u8>, u64)>, DoubleSignError> {
        match self.check_hrs(height, round, step)? {
            HrsCheck::Fresh => Ok(None),
            HrsCheck::SameHrs => {
                let (last_timestamp, timestamp_only) = self.only_differ_by_timestamp(sign_bytes);
                if timestamp_only {
                    Ok(Some((self.signature.clone(), last_timestamp)))
                } else {
                    Err(DoubleSignError::ConflictingPayload {
                        height,
                        round,
                        step,
                    })
                }
            }
        }
    }

    /// Advances the watermark and durably persists it. No partial update is
    /// observable: the new state is written to a temp file, fsynced, then
    /// renamed over the old one.
    pub fn commit(
        &mut self,
        height: i64,
        round: i64,
        step: i8,
        ephemeral_public: &[u8],
        signature: &[u8],
        sign_bytes: &[u8],
    ) -> Result<(), SignerError> {
        self.height = height;
        self.round = round;
        self.step = step;
        self.ephemeral_public = ephemeral_public.to_vec();
        self.signature = signature.to_vec();
        self.sign_bytes = sign_bytes.to_vec();
        self.save()
    }

    fn save(&self) -> Result<(), SignerError> {
        let path = match &self.file_path {
            Some(path) => path,
            None => panic!("cannot save sign state: file path not set"),
        };
        let temp_path = path.with_extension("tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&temp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
        }
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&temp_path, path)?;

        debug!(
            "persisted sign state {:?} at height {} round {} step {}",
            path, self.height, self.round, self.step
        );
        Ok(())
    }
}

/// Loads a sign state from disk. The file must exist.
pub fn load_sign_state(path: impl AsRef<Path>) -> Result<SignState, SignerError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)?;
    let mut state: SignState = serde_json::from_str(&raw)?;
    state.file_path = Some(path.to_path_buf());
    Ok(state)
}

/// Loads the sign state at `path`, initializing an empty one on disk if the
/// file cannot be loaded.
pub fn load_or_create_sign_state(path: impl AsRef<Path>) -> Result<SignState, SignerError> {
    let path = path.as_ref();
    match load_sign_state(path) {
        Ok(state) => Ok(state),
        Err(_) => {
            info!("initializing empty sign state at {:?}", path);
            let mut state = SignState {
                file_path: Some(path.to_path_buf()),
                ..SignState::default()
            };
            state.save()?;
            Ok(state)
        }
    }
}

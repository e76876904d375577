//! Error types for the signer.
//!
//! `DoubleSignError` covers everything the high-watermark refuses; it is
//! always surfaced to the caller and never terminates the process.
//! `SignerError` covers the rest of the taxonomy (peer failures, transport,
//! configuration).

use thiserror::Error;

/// A request that would put the validator at risk of signing twice.
#[derive(Debug, Error)]
pub enum DoubleSignError {
    #[error("height regression: got {got}, last signed height {last}")]
    HeightRegression { got: i64, last: i64 },

    #[error("round regression at height {height}: got {got}, last round {last}")]
    RoundRegression { height: i64, got: i64, last: i64 },

    #[error("step regression at height {height} round {round}: got {got}, last step {last}")]
    StepRegression {
        height: i64,
        round: i64,
        got: i8,
        last: i8,
    },

    #[error("no payload recorded for height {height} round {round} step {step}")]
    MissingPayload { height: i64, round: i64, step: i8 },

    #[error(
        "conflicting payload at height {height} round {round} step {step}: \
         differs beyond timestamp from what was already signed"
    )]
    ConflictingPayload { height: i64, round: i64, step: i8 },
}

/// Errors from signing, cosigner coordination and transport.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("double sign risk: {0}")]
    DoubleSign(#[from] DoubleSignError),

    #[error("cosigner {id}: {reason}")]
    CosignerUnavailable { id: u8, reason: String },

    #[error("peer authentication failed for cosigner {0}")]
    AuthFailure(u8),

    #[error("unknown cosigner id {0}")]
    UnknownPeer(u8),

    #[error("insufficient cosigners: {got} responded, threshold is {need}")]
    InsufficientCosigners { got: usize, need: usize },

    #[error("not enough ephemeral shares for height {height} round {round} step {step}: have {have}, need {need}")]
    MissingEphemeralShares {
        height: i64,
        round: i64,
        step: i8,
        have: usize,
        need: usize,
    },

    #[error("combined signature failed verification")]
    InvalidCombinedSignature,

    #[error("cannot decode sign payload: {0}")]
    Decode(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON file error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SignerError {
    /// Errors that abort a cosigner for the current round but leave the
    /// round able to succeed on a remaining quorum.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SignerError::CosignerUnavailable { .. }
                | SignerError::Io(_)
                | SignerError::Serialization(_)
        )
    }
}

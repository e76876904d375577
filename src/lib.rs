//! Remote validator signer with m-of-n threshold cosigning.
//!
//! This crate keeps a consensus validator's signing key off the node. The
//! daemon dials the consensus node, answers framed signing requests, and
//! refuses anything that could lead to an equivocation: a persistent
//! (height, round, step) high-watermark guards every signature, and in the
//! hardened `mpc` mode the key itself is split across a cluster of
//! cosigners so no single machine can sign alone.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   framed stream   ┌──────────────────┐
//! │ Consensus node  │ ◄───────────────► │ ReconnRemoteSigner│
//! └─────────────────┘                   │   PvGuard         │
//!                                       │   Single/Threshold│
//!                                       └────────┬─────────┘
//!                                cosigner RPC    │
//!                    ┌───────────────────────────┼──────────┐
//!                    ▼                           ▼          ▼
//!               LocalCosigner            RemoteCosigner  RemoteCosigner
//! ```
//!
//! ## Double-sign protection
//!
//! - **Monotonicity**: the persisted watermark never goes backwards.
//! - **At most one signature per (height, round, step)**: a repeat request
//!   that differs only in its timestamp is answered with the original
//!   signature, bit for bit; anything else is refused.
//! - **Commit before release**: no signature leaves the process before the
//!   state recording it has been fsynced. In threshold mode every cosigner
//!   enforces the same discipline on its own share contributions.

pub mod canonical;
pub mod config;
pub mod cosigner;
mod encoding;
pub mod error;
pub mod key;
pub mod protocol;
pub mod remote_cosigner;
pub mod remote_signer;
pub mod rpc;
pub mod shares;
pub mod sign_state;
pub mod threshold;
pub mod validator;

pub use canonical::{BlockId, Proposal, Vote, VoteType};
pub use config::{Config, Mode};
pub use cosigner::{Cosigner, EphemeralSecretPart, LocalCosigner, PartialSignature};
pub use error::{DoubleSignError, SignerError};
pub use key::CosignerKey;
pub use remote_cosigner::RemoteCosigner;
pub use remote_signer::{ReconnRemoteSigner, RemoteSignerHandle};
pub use rpc::{CosignerRpcServer, CosignerRequest, CosignerResponse};
pub use sign_state::{load_or_create_sign_state, load_sign_state, SignState};
pub use threshold::ThresholdSigner;
pub use validator::{PvGuard, SingleSigner, ValidatorSigner};

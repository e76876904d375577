//! Wire protocol between consensus nodes and the signer.
//!
//! Messages are bincode-encoded and length-prefixed with a little-endian
//! u32. The same framing carries the cosigner RPC. Transport authentication
//! and encryption are supplied by the surrounding channel; the protocol
//! treats the stream as reliable framed bytes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};

use crate::canonical::{Proposal, Vote};
use crate::error::SignerError;

/// Upper bound on a single frame.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Writes one length-prefixed message.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), SignerError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(SignerError::Decode(format!(
            "outgoing frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed message.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, SignerError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(SignerError::Decode(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Requests a consensus node may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    PubKey,
    SignVote(SignVoteRequest),
    SignProposal(SignProposalRequest),
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignVoteRequest {
    pub vote: Vote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignProposalRequest {
    pub proposal: Proposal,
}

/// Structured in-band error. The code is always zero; consumers key off
/// the description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSignerError {
    pub code: i32,
    pub description: String,
}

impl RemoteSignerError {
    pub fn new(description: impl Into<String>) -> Self {
        RemoteSignerError {
            code: 0,
            description: description.into(),
        }
    }
}

/// Responses to [`Request`]s. Signing responses carry either the signed
/// object or an in-band error, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    PubKey(PubKeyResponse),
    SignedVote(SignedVoteResponse),
    SignedProposal(SignedProposalResponse),
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubKeyResponse {
    pub pub_key: Vec<u8>,
    pub error: Option<RemoteSignerError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedVoteResponse {
    pub vote: Option<Vote>,
    pub error: Option<RemoteSignerError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedProposalResponse {
    pub proposal: Option<Proposal>,
    pub error: Option<RemoteSignerError>,
}

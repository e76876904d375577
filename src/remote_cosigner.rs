//! Client stub for a cosigner running on another machine.
//!
//! Connects per request with a fixed deadline on connect, read and write.
//! Any transport failure or in-band refusal surfaces as a transient
//! cosigner error; the caller drops the peer for the current round.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::cosigner::{Cosigner, EphemeralSecretPart, PartialSignature};
use crate::error::SignerError;
use crate::protocol::{read_frame, write_frame};
use crate::rpc::{CosignerRequest, CosignerResponse};

/// Default deadline for a single peer RPC.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// A peer cosigner reachable over the network.
pub struct RemoteCosigner {
    id: u8,
    address: String,
    timeout: Duration,
}

impl RemoteCosigner {
    pub fn new(id: u8, address: String) -> Self {
        RemoteCosigner {
            id,
            address,
            timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    pub fn with_timeout(id: u8, address: String, timeout: Duration) -> Self {
        RemoteCosigner {
            id,
            address,
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn unavailable(&self, reason: impl ToString) -> SignerError {
        SignerError::CosignerUnavailable {
            id: self.id,
            reason: reason.to_string(),
        }
    }

    fn call(&self, request: &CosignerRequest) -> Result<CosignerResponse, SignerError> {
        let address: SocketAddr = self
            .address
            .to_socket_addrs()
            .map_err(|err| self.unavailable(err))?
            .next()
            .ok_or_else(|| self.unavailable("address resolves to nothing"))?;
        let mut stream = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|err| self.unavailable(err))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|err| self.unavailable(err))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|err| self.unavailable(err))?;

        write_frame(&mut stream, request).map_err(|err| self.unavailable(err))?;
        read_frame(&mut stream).map_err(|err| self.unavailable(err))
    }
}

impl Cosigner for RemoteCosigner {
    fn id(&self) -> u8 {
        self.id
    }

    fn get_ephemeral_secret_part(
        &self,
        height: i64,
        round: i64,
        step: i8,
        destination_id: u8,
    ) -> Result<EphemeralSecretPart, SignerError> {
        match self.call(&CosignerRequest::GetEphemeralSecretPart {
            height,
            round,
            step,
            destination_id,
        })? {
            CosignerResponse::EphemeralSecretPart(part) => Ok(part),
            CosignerResponse::Error(description) => Err(self.unavailable(description)),
            _ => Err(self.unavailable("unexpected response")),
        }
    }

    fn set_ephemeral_secret_part(&self, part: EphemeralSecretPart) -> Result<(), SignerError> {
        match self.call(&CosignerRequest::SetEphemeralSecretPart(part))? {
            CosignerResponse::EphemeralSecretPartSet => Ok(()),
            CosignerResponse::Error(description) => Err(self.unavailable(description)),
            _ => Err(self.unavailable("unexpected response")),
        }
    }

    fn sign_partial(&self, sign_bytes: &[u8]) -> Result<PartialSignature, SignerError> {
        match self.call(&CosignerRequest::SignPartial {
            sign_bytes: sign_bytes.to_vec(),
        })? {
            CosignerResponse::Partial(partial) => Ok(partial),
            CosignerResponse::Error(description) => Err(self.unavailable(description)),
            _ => Err(self.unavailable("unexpected response")),
        }
    }
}

//! Cosigner RPC server.
//!
//! Exposes the local cosigner's peer-facing operations over the shared
//! framed transport: one accept loop, one handler thread per connected
//! peer. Share deliveries are authenticated by RSA metadata signatures
//! against the known peer table; anything outside that table is rejected
//! by the cosigner itself.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cosigner::{Cosigner, EphemeralSecretPart, LocalCosigner, PartialSignature};
use crate::error::SignerError;
use crate::protocol::{read_frame, write_frame};

/// Peer-facing requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CosignerRequest {
    GetEphemeralSecretPart {
        height: i64,
        round: i64,
        step: i8,
        destination_id: u8,
    },
    SetEphemeralSecretPart(EphemeralSecretPart),
    SignPartial {
        sign_bytes: Vec<u8>,
    },
    GetEphemeralPublic {
        height: i64,
        round: i64,
        step: i8,
    },
    GetId,
}

/// Peer-facing responses. Failures travel in-band as `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CosignerResponse {
    EphemeralSecretPart(EphemeralSecretPart),
    EphemeralSecretPartSet,
    Partial(PartialSignature),
    EphemeralPublic(Vec<u8>),
    Id(u8),
    Error(String),
}

/// Framed RPC server in front of a [`LocalCosigner`].
pub struct CosignerRpcServer {
    listener: TcpListener,
    cosigner: Arc<LocalCosigner>,
    running: Arc<AtomicBool>,
}

/// Handle to a running RPC server; stopping joins the accept loop.
pub struct CosignerRpcHandle {
    address: SocketAddr,
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CosignerRpcServer {
    pub fn bind(address: impl ToSocketAddrs, cosigner: Arc<LocalCosigner>) -> Result<Self, SignerError> {
        let listener = TcpListener::bind(address)?;
        info!("cosigner RPC listening on {:?}", listener.local_addr()?);
        Ok(CosignerRpcServer {
            listener,
            cosigner,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SignerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop on a background thread and returns a stop
    /// handle.
    pub fn spawn(self) -> Result<CosignerRpcHandle, SignerError> {
        let address = self.local_addr()?;
        let running = self.running.clone();
        let thread = thread::spawn(move || self.run());
        Ok(CosignerRpcHandle {
            address,
            running,
            thread,
        })
    }

    fn run(&self) {
        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let cosigner = self.cosigner.clone();
                    thread::spawn(move || handle_peer(&cosigner, stream));
                }
                Err(err) => error!("cosigner RPC accept failed: {}", err),
            }
        }
        debug!("cosigner RPC accept loop exited");
    }
}

impl CosignerRpcHandle {
    /// Stops the accept loop and waits for it to exit. In-flight peer
    /// handlers finish their current connection.
    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.address);
        let _ = self.thread.join();
    }
}

fn handle_peer(cosigner: &LocalCosigner, mut stream: TcpStream) {
    loop {
        let request: CosignerRequest = match read_frame(&mut stream) {
            Ok(request) => request,
            // Peers disconnect between requests; anything else is logged.
            Err(SignerError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!("cosigner RPC connection closed: {}", err);
                return;
            }
        };
        let response = dispatch(cosigner, request);
        if let Err(err) = write_frame(&mut stream, &response) {
            warn!("cosigner RPC write failed: {}", err);
            return;
        }
    }
}

fn dispatch(cosigner: &LocalCosigner, request: CosignerRequest) -> CosignerResponse {
    match request {
        CosignerRequest::GetEphemeralSecretPart {
            height,
            round,
            step,
            destination_id,
        } => match cosigner.get_ephemeral_secret_part(height, round, step, destination_id) {
            Ok(part) => CosignerResponse::EphemeralSecretPart(part),
            Err(err) => {
                warn!("refusing ephemeral share request: {}", err);
                CosignerResponse::Error(err.to_string())
            }
        },
        CosignerRequest::SetEphemeralSecretPart(part) => {
            match cosigner.set_ephemeral_secret_part(part) {
                Ok(()) => CosignerResponse::EphemeralSecretPartSet,
                Err(err) => {
                    warn!("refusing ephemeral share delivery: {}", err);
                    CosignerResponse::Error(err.to_string())
                }
            }
        }
        CosignerRequest::SignPartial { sign_bytes } => match cosigner.sign_partial(&sign_bytes) {
            Ok(partial) => CosignerResponse::Partial(partial),
            Err(err) => {
                warn!("refusing partial signature request: {}", err);
                CosignerResponse::Error(err.to_string())
            }
        },
        CosignerRequest::GetEphemeralPublic {
            height,
            round,
            step,
        } => match cosigner.get_ephemeral_public(height, round, step) {
            Ok(public) => CosignerResponse::EphemeralPublic(public),
            Err(err) => CosignerResponse::Error(err.to_string()),
        },
        CosignerRequest::GetId => CosignerResponse::Id(cosigner.id()),
    }
}

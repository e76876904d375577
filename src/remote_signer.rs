//! Reconnecting remote signer service.
//!
//! One long-lived task per consensus node: dial the node, answer framed
//! signing requests through the guarded validator, reconnect on any
//! transport error with a fixed backoff. Signing failures are answered
//! in-band and never close the stream; only transport errors do. The
//! authenticated-channel handshake is supplied by the surrounding
//! deployment; this service treats the stream as reliable framed bytes.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::protocol::{
    read_frame, write_frame, PubKeyResponse, RemoteSignerError, Request, Response,
    SignedProposalResponse, SignedVoteResponse,
};
use crate::validator::ValidatorSigner;

/// Fixed delay between dial attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

const BACKOFF_SLICE: Duration = Duration::from_millis(100);

/// Dials a consensus node and serves signing requests until stopped.
pub struct ReconnRemoteSigner {
    address: String,
    validator: Arc<dyn ValidatorSigner + Sync>,
    running: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<TcpStream>>>,
}

/// Handle to a running signer service; stopping closes the connection and
/// joins the loop.
pub struct RemoteSignerHandle {
    running: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<TcpStream>>>,
    thread: JoinHandle<()>,
}

impl ReconnRemoteSigner {
    pub fn new(address: String, validator: Arc<dyn ValidatorSigner + Sync>) -> Self {
        ReconnRemoteSigner {
            address,
            validator,
            running: Arc::new(AtomicBool::new(true)),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs the dial-and-serve loop on a background thread.
    pub fn start(self) -> RemoteSignerHandle {
        let running = self.running.clone();
        let conn = self.conn.clone();
        let thread = thread::spawn(move || self.run());
        RemoteSignerHandle {
            running,
            conn,
            thread,
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let stream = match TcpStream::connect(&self.address) {
                Ok(stream) => stream,
                Err(err) => {
                    error!("dialing {} failed: {}", self.address, err);
                    info!("retrying {} in {:?}", self.address, RETRY_BACKOFF);
                    self.backoff();
                    continue;
                }
            };
            info!("connected to consensus node at {}", self.address);
            if let Ok(clone) = stream.try_clone() {
                *self.conn.lock().unwrap() = Some(clone);
            }
            self.serve(stream);
            *self.conn.lock().unwrap() = None;
        }
    }

    fn backoff(&self) {
        let mut waited = Duration::ZERO;
        while self.running.load(Ordering::SeqCst) && waited < RETRY_BACKOFF {
            thread::sleep(BACKOFF_SLICE);
            waited += BACKOFF_SLICE;
        }
    }

    fn serve(&self, mut stream: TcpStream) {
        while self.running.load(Ordering::SeqCst) {
            let request: Request = match read_frame(&mut stream) {
                Ok(request) => request,
                Err(err) => {
                    warn!("connection to {} lost: {}", self.address, err);
                    return;
                }
            };
            let response = self.handle_request(request);
            if let Err(err) = write_frame(&mut stream, &response) {
                warn!("writing to {} failed: {}", self.address, err);
                return;
            }
        }
    }

    fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::PubKey => match self.validator.public_key() {
                Ok(pub_key) => Response::PubKey(PubKeyResponse {
                    pub_key,
                    error: None,
                }),
                Err(err) => {
                    error!("failed to get public key: {}", err);
                    Response::PubKey(PubKeyResponse {
                        pub_key: Vec::new(),
                        error: Some(RemoteSignerError::new(err.to_string())),
                    })
                }
            },
            Request::SignVote(request) => {
                let mut vote = request.vote;
                match self.validator.sign_vote(&mut vote) {
                    Ok(()) => {
                        info!(
                            "signed vote at height {} round {} for {}",
                            vote.height, vote.round, self.address
                        );
                        Response::SignedVote(SignedVoteResponse {
                            vote: Some(vote),
                            error: None,
                        })
                    }
                    Err(err) => {
                        error!(
                            "refusing to sign vote at height {} round {}: {}",
                            vote.height, vote.round, err
                        );
                        Response::SignedVote(SignedVoteResponse {
                            vote: None,
                            error: Some(RemoteSignerError::new(err.to_string())),
                        })
                    }
                }
            }
            Request::SignProposal(request) => {
                let mut proposal = request.proposal;
                match self.validator.sign_proposal(&mut proposal) {
                    Ok(()) => {
                        info!(
                            "signed proposal at height {} round {} for {}",
                            proposal.height, proposal.round, self.address
                        );
                        Response::SignedProposal(SignedProposalResponse {
                            proposal: Some(proposal),
                            error: None,
                        })
                    }
                    Err(err) => {
                        error!(
                            "refusing to sign proposal at height {} round {}: {}",
                            proposal.height, proposal.round, err
                        );
                        Response::SignedProposal(SignedProposalResponse {
                            proposal: None,
                            error: Some(RemoteSignerError::new(err.to_string())),
                        })
                    }
                }
            }
            Request::Ping => Response::Pong,
        }
    }
}

impl RemoteSignerHandle {
    /// Signals the loop to stop, closes any open connection and waits for
    /// the loop to exit.
    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self.conn.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = self.thread.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{BlockId, Vote, VoteType};
    use crate::protocol::SignVoteRequest;
    use crate::sign_state::load_or_create_sign_state;
    use crate::validator::{PvGuard, SingleSigner};
    use ed25519_dalek::SigningKey;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn test_validator(dir: &TempDir) -> Arc<PvGuard> {
        let state = load_or_create_sign_state(dir.path().join("state.json")).unwrap();
        let signer = SingleSigner::new(
            SigningKey::from_bytes(&[7u8; 32]),
            "test-chain".to_string(),
            state,
        );
        Arc::new(PvGuard::new(Box::new(signer)))
    }

    fn test_vote(height: i64, block_byte: u8) -> Vote {
        let mut hash = [0u8; 32];
        hash[0] = block_byte;
        Vote {
            vote_type: VoteType::Prevote,
            height,
            round: 0,
            block_id: BlockId(hash),
            timestamp: 1_000,
            signature: Vec::new(),
        }
    }

    #[test]
    fn test_serves_requests_and_survives_signing_errors() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let signer = ReconnRemoteSigner::new(address, test_validator(&dir));
        let handle = signer.start();

        let (mut node, _) = listener.accept().unwrap();

        // Public key.
        write_frame(&mut node, &Request::PubKey).unwrap();
        match read_frame::<Response>(&mut node).unwrap() {
            Response::PubKey(response) => {
                assert!(response.error.is_none());
                assert_eq!(response.pub_key.len(), 32);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // A vote is signed.
        write_frame(
            &mut node,
            &Request::SignVote(SignVoteRequest {
                vote: test_vote(10, 1),
            }),
        )
        .unwrap();
        match read_frame::<Response>(&mut node).unwrap() {
            Response::SignedVote(response) => {
                let vote = response.vote.unwrap();
                assert!(!vote.signature.is_empty());
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // A regression is refused in-band with code zero; the stream stays
        // open.
        write_frame(
            &mut node,
            &Request::SignVote(SignVoteRequest {
                vote: test_vote(9, 1),
            }),
        )
        .unwrap();
        match read_frame::<Response>(&mut node).unwrap() {
            Response::SignedVote(response) => {
                assert!(response.vote.is_none());
                let error = response.error.unwrap();
                assert_eq!(error.code, 0);
                assert!(error.description.contains("height regression"));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        write_frame(&mut node, &Request::Ping).unwrap();
        assert!(matches!(
            read_frame::<Response>(&mut node).unwrap(),
            Response::Pong
        ));

        handle.stop();
    }

    #[test]
    fn test_reconnects_after_transport_error() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let signer = ReconnRemoteSigner::new(address, test_validator(&dir));
        let handle = signer.start();

        {
            let (mut node, _) = listener.accept().unwrap();
            write_frame(&mut node, &Request::Ping).unwrap();
            assert!(matches!(
                read_frame::<Response>(&mut node).unwrap(),
                Response::Pong
            ));
            // Dropping the connection forces a reconnect.
        }

        let (mut node, _) = listener.accept().unwrap();
        write_frame(&mut node, &Request::Ping).unwrap();
        assert!(matches!(
            read_frame::<Response>(&mut node).unwrap(),
            Response::Pong
        ));

        handle.stop();
    }

    #[test]
    fn test_stop_while_dialing() {
        let dir = TempDir::new().unwrap();
        // Nothing listens here; the service stays in its dial loop.
        let signer = ReconnRemoteSigner::new("127.0.0.1:1".to_string(), test_validator(&dir));
        let handle = signer.start();
        thread::sleep(Duration::from_millis(150));
        handle.stop();
    }
}

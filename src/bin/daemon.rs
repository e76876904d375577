//! Remote signer daemon.
//!
//! Loads the configuration, assembles the single-key or threshold
//! validator, and serves signing requests to every configured consensus
//! node until the process is stopped.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quorum_signer::config::{Config, Mode};
use quorum_signer::cosigner::{Cosigner, LocalCosigner};
use quorum_signer::error::SignerError;
use quorum_signer::key::{self, CosignerKey};
use quorum_signer::remote_cosigner::RemoteCosigner;
use quorum_signer::remote_signer::ReconnRemoteSigner;
use quorum_signer::rpc::{CosignerRpcHandle, CosignerRpcServer};
use quorum_signer::sign_state::{load_or_create_sign_state, load_sign_state};
use quorum_signer::threshold::ThresholdSigner;
use quorum_signer::validator::{PvGuard, SingleSigner, ValidatorSigner};

/// Remote validator signer daemon.
#[derive(Parser, Debug)]
#[command(name = "quorum-signer-daemon")]
#[command(about = "Remote validator signer with threshold cosigning")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load config {:?}: {}", args.config, err);
            std::process::exit(1);
        }
    };

    info!("starting quorum-signer-daemon");
    info!(
        "mode: {:?}, chain id: {}, key file: {:?}, state dir: {:?}",
        config.mode, config.chain_id, config.priv_val_key_file, config.priv_val_state_dir
    );

    let (validator, rpc_handle) = match build_validator(&config) {
        Ok(built) => built,
        Err(err) => {
            error!("failed to initialize validator: {}", err);
            std::process::exit(1);
        }
    };
    let guard = Arc::new(PvGuard::new(validator));

    if config.nodes.is_empty() {
        warn!("no consensus nodes configured; serving cosigner RPC only");
    }
    let mut services = Vec::new();
    for node in &config.nodes {
        info!("dialing consensus node at {}", node.address);
        services.push(ReconnRemoteSigner::new(node.address.clone(), guard.clone()).start());
    }

    // Shutdown is delivered by the supervisor killing the process; the
    // services and the RPC server run until then.
    let _services = services;
    let _rpc_handle = rpc_handle;
    loop {
        std::thread::park();
    }
}

fn build_validator(
    config: &Config,
) -> Result<(Box<dyn ValidatorSigner>, Option<CosignerRpcHandle>), SignerError> {
    match config.mode {
        Mode::Single => {
            let signing_key = key::load_ed25519_key(&config.priv_val_key_file)?;
            let state = load_or_create_sign_state(config.priv_validator_state_file())?;
            let signer =
                SingleSigner::new(signing_key, config.chain_id.clone(), state);
            Ok((Box::new(signer), None))
        }
        Mode::Mpc => {
            let cosigner_key = CosignerKey::load(&config.priv_val_key_file)?;
            let threshold = config
                .cosigner_threshold
                .ok_or_else(|| SignerError::Config("cosigner_threshold is required".to_string()))?;

            // The validator-level state only caches assembled signatures,
            // so it may be initialized on the fly. The share state is the
            // one that actually prevents a double sign; it must already
            // exist.
            let validator_state = load_or_create_sign_state(config.priv_validator_state_file())?;
            let share_state = load_sign_state(config.share_sign_state_file()).map_err(|err| {
                SignerError::Config(format!(
                    "share sign state {:?} cannot be loaded: {}",
                    config.share_sign_state_file(),
                    err
                ))
            })?;

            let local = Arc::new(
                LocalCosigner::new(cosigner_key, share_state, threshold)?
                    .with_meta_ttl(config.meta_ttl()),
            );
            info!(
                "cosigner {} of {}, threshold {}",
                local.id(),
                local.total(),
                threshold
            );

            let mut peers: Vec<Arc<dyn Cosigner>> = Vec::new();
            for peer in &config.cosigners {
                peers.push(Arc::new(RemoteCosigner::with_timeout(
                    peer.id,
                    peer.address.clone(),
                    config.rpc_timeout(),
                )));
            }

            let listen_address = config
                .cosigner_listen_address
                .as_deref()
                .ok_or_else(|| {
                    SignerError::Config("cosigner_listen_address is required".to_string())
                })?;
            let rpc_server = CosignerRpcServer::bind(listen_address, local.clone())?;
            let rpc_handle = rpc_server.spawn()?;

            let signer = ThresholdSigner::new(
                local,
                peers,
                config.chain_id.clone(),
                validator_state,
            )?;
            Ok((Box::new(signer), Some(rpc_handle)))
        }
    }
}

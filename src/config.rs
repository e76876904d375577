//! Daemon configuration.
//!
//! Loaded from a TOML file. `single` mode needs only the key file and
//! state directory; `mpc` mode additionally requires the threshold, the
//! cosigner listen address and the remote peer list.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SignerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Single,
    Mpc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosignerPeerConfig {
    pub id: u8,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub chain_id: String,
    /// Ed25519 key file in `single` mode, cosigner key file in `mpc` mode.
    pub priv_val_key_file: PathBuf,
    pub priv_val_state_dir: PathBuf,
    #[serde(default)]
    pub cosigner_threshold: Option<u8>,
    #[serde(default)]
    pub cosigner_listen_address: Option<String>,
    #[serde(default)]
    pub cosigners: Vec<CosignerPeerConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Deadline for a single cosigner RPC, in seconds.
    #[serde(default = "default_rpc_timeout_secs")]
    pub cosigner_rpc_timeout_secs: u64,
    /// Idle lifetime of per-round nonce metadata, in seconds.
    #[serde(default = "default_meta_ttl_secs")]
    pub hrs_meta_ttl_secs: u64,
}

fn default_rpc_timeout_secs() -> u64 {
    3
}

fn default_meta_ttl_secs() -> u64 {
    600
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&raw)
            .map_err(|err| SignerError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SignerError> {
        if self.chain_id.is_empty() {
            return Err(SignerError::Config("chain_id is required".to_string()));
        }
        if self.mode == Mode::Mpc {
            match self.cosigner_threshold {
                None | Some(0) => {
                    return Err(SignerError::Config(
                        "cosigner_threshold is required in mpc mode".to_string(),
                    ))
                }
                Some(_) => {}
            }
            if self.cosigner_listen_address.is_none() {
                return Err(SignerError::Config(
                    "cosigner_listen_address is required in mpc mode".to_string(),
                ));
            }
            if self.cosigners.is_empty() {
                return Err(SignerError::Config(
                    "at least one remote cosigner is required in mpc mode".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.cosigner_rpc_timeout_secs)
    }

    pub fn meta_ttl(&self) -> Duration {
        Duration::from_secs(self.hrs_meta_ttl_secs)
    }

    /// Path of the validator-level sign state file.
    pub fn priv_validator_state_file(&self) -> PathBuf {
        self.priv_val_state_dir
            .join(format!("{}_priv_validator_state.json", self.chain_id))
    }

    /// Path of this cosigner's share sign state file.
    pub fn share_sign_state_file(&self) -> PathBuf {
        self.priv_val_state_dir
            .join(format!("{}_share_sign_state.json", self.chain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_CONFIG: &str = r#"
        mode = "single"
        chain_id = "test-chain"
        priv_val_key_file = "/etc/signer/priv_validator_key.json"
        priv_val_state_dir = "/var/lib/signer"

        [[nodes]]
        address = "10.0.0.1:1234"
    "#;

    const MPC_CONFIG: &str = r#"
        mode = "mpc"
        chain_id = "test-chain"
        priv_val_key_file = "/etc/signer/cosigner.json"
        priv_val_state_dir = "/var/lib/signer"
        cosigner_threshold = 2
        cosigner_listen_address = "0.0.0.0:2222"

        [[cosigners]]
        id = 2
        address = "10.0.0.2:2222"

        [[cosigners]]
        id = 3
        address = "10.0.0.3:2222"

        [[nodes]]
        address = "10.0.0.1:1234"
    "#;

    #[test]
    fn test_parse_single_mode() {
        let config: Config = toml::from_str(SINGLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, Mode::Single);
        assert_eq!(config.chain_id, "test-chain");
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.cosigner_rpc_timeout_secs, 3);
    }

    #[test]
    fn test_parse_mpc_mode() {
        let config: Config = toml::from_str(MPC_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, Mode::Mpc);
        assert_eq!(config.cosigner_threshold, Some(2));
        assert_eq!(config.cosigners.len(), 2);
        assert_eq!(config.cosigners[0].id, 2);
    }

    #[test]
    fn test_state_file_paths() {
        let config: Config = toml::from_str(SINGLE_CONFIG).unwrap();
        assert_eq!(
            config.priv_validator_state_file(),
            PathBuf::from("/var/lib/signer/test-chain_priv_validator_state.json")
        );
        assert_eq!(
            config.share_sign_state_file(),
            PathBuf::from("/var/lib/signer/test-chain_share_sign_state.json")
        );
    }

    #[test]
    fn test_mpc_mode_requires_threshold() {
        let raw = MPC_CONFIG.replace("cosigner_threshold = 2", "");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mpc_mode_requires_listen_address() {
        let raw = MPC_CONFIG.replace("cosigner_listen_address = \"0.0.0.0:2222\"", "");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_chain_id_rejected() {
        let raw = SINGLE_CONFIG.replace("chain_id = \"test-chain\"", "chain_id = \"\"");
        let config: Config = toml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let raw = SINGLE_CONFIG.replace("mode = \"single\"", "mode = \"quorum\"");
        assert!(toml::from_str::<Config>(&raw).is_err());
    }
}

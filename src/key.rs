//! Key files.
//!
//! Single mode loads a plain Ed25519 signing key. Threshold mode loads a
//! `CosignerKey`: this cosigner's share of the validator secret, an RSA
//! keypair for authenticating to peers, and the RSA public keys of every
//! cosigner in the cluster ordered by ID. File permissions are expected to
//! be restrictive; the loader does not enforce them.

use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

use crate::encoding;
use crate::error::SignerError;
use crate::shares;

/// Key material for one member of an m-of-n signing cluster.
#[derive(Debug, Clone)]
pub struct CosignerKey {
    /// Aggregate validator public key (Ed25519, 32 bytes).
    pub public_key: [u8; 32],
    /// This cosigner's share of the validator secret.
    pub secret_share: Scalar,
    /// RSA keypair used to authenticate to peers and unseal their shares.
    pub rsa_key: RsaPrivateKey,
    /// This cosigner's ID, 1-based.
    pub id: u8,
    /// RSA public keys of all cosigners, ordered by ID (index + 1).
    pub rsa_pubs: Vec<RsaPublicKey>,
}

/// On-disk shape of a [`CosignerKey`]: binary fields base64, RSA keys as
/// PKCS#1 DER.
#[derive(Serialize, Deserialize)]
struct CosignerKeyFile {
    #[serde(with = "encoding::b64")]
    pub_key: Vec<u8>,
    #[serde(with = "encoding::b64")]
    secret_share: Vec<u8>,
    #[serde(with = "encoding::b64")]
    rsa_key: Vec<u8>,
    id: u8,
    rsa_pubs: Vec<String>,
}

impl CosignerKey {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let file: CosignerKeyFile = serde_json::from_str(&raw)?;
        Self::from_file(file)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SignerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string_pretty(&self.to_file()?)?;
        fs::write(path, encoded)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    fn to_file(&self) -> Result<CosignerKeyFile, SignerError> {
        let rsa_der = self
            .rsa_key
            .to_pkcs1_der()
            .map_err(|err| SignerError::Config(format!("cannot encode RSA key: {err}")))?;
        let rsa_pubs = self
            .rsa_pubs
            .iter()
            .map(|public| {
                public
                    .to_pkcs1_der()
                    .map(|der| B64.encode(der.as_bytes()))
                    .map_err(|err| SignerError::Config(format!("cannot encode RSA public key: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CosignerKeyFile {
            pub_key: self.public_key.to_vec(),
            secret_share: self.secret_share.to_bytes().to_vec(),
            rsa_key: rsa_der.as_bytes().to_vec(),
            id: self.id,
            rsa_pubs,
        })
    }

    fn from_file(file: CosignerKeyFile) -> Result<Self, SignerError> {
        let public_key: [u8; 32] = file
            .pub_key
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::Config("validator public key is not 32 bytes".to_string()))?;
        let secret_share = shares::scalar_from_bytes(&file.secret_share)
            .map_err(|_| SignerError::Config("invalid secret share".to_string()))?;
        let rsa_key = RsaPrivateKey::from_pkcs1_der(&file.rsa_key)
            .map_err(|err| SignerError::Config(format!("invalid RSA key: {err}")))?;
        let rsa_pubs = file
            .rsa_pubs
            .iter()
            .map(|encoded| {
                let der = B64
                    .decode(encoded.as_bytes())
                    .map_err(|err| SignerError::Config(format!("invalid RSA public key encoding: {err}")))?;
                RsaPublicKey::from_pkcs1_der(&der)
                    .map_err(|err| SignerError::Config(format!("invalid RSA public key: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if file.id < 1 || file.id as usize > rsa_pubs.len() {
            return Err(SignerError::Config(format!(
                "cosigner id {} out of range for {} peers",
                file.id,
                rsa_pubs.len()
            )));
        }
        Ok(CosignerKey {
            public_key,
            secret_share,
            rsa_key,
            id: file.id,
            rsa_pubs,
        })
    }
}

/// On-disk shape of the single-mode Ed25519 key.
#[derive(Serialize, Deserialize)]
struct PrivValidatorKeyFile {
    #[serde(with = "encoding::b64")]
    pub_key: Vec<u8>,
    #[serde(with = "encoding::b64")]
    priv_key: Vec<u8>,
}

/// Loads the single-mode Ed25519 signing key.
pub fn load_ed25519_key(path: impl AsRef<Path>) -> Result<SigningKey, SignerError> {
    let raw = fs::read_to_string(path.as_ref())?;
    let file: PrivValidatorKeyFile = serde_json::from_str(&raw)?;
    let seed: [u8; 32] = file
        .priv_key
        .as_slice()
        .try_into()
        .map_err(|_| SignerError::Config("private key is not 32 bytes".to_string()))?;
    let key = SigningKey::from_bytes(&seed);
    if file.pub_key.as_slice() != key.verifying_key().as_bytes().as_slice() {
        return Err(SignerError::Config(
            "public key in key file does not match private key".to_string(),
        ));
    }
    Ok(key)
}

/// Writes a single-mode Ed25519 key file.
pub fn save_ed25519_key(path: impl AsRef<Path>, key: &SigningKey) -> Result<(), SignerError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = PrivValidatorKeyFile {
        pub_key: key.verifying_key().as_bytes().to_vec(),
        priv_key: key.to_bytes().to_vec(),
    };
    fs::write(path, serde_json::to_string_pretty(&file)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Deals a complete cosigner key set for an m-of-n cluster. Used by tests
/// and provisioning tooling; production key ceremonies happen elsewhere.
pub fn deal_cosigner_keys(
    threshold: u8,
    total: u8,
    rsa_bits: usize,
) -> Result<([u8; 32], Vec<CosignerKey>), SignerError> {
    let (public_key, secret_shares) = shares::deal_signing_key(threshold, total);

    let rsa_keys = (0..total)
        .map(|_| RsaPrivateKey::new(&mut OsRng, rsa_bits))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| SignerError::Crypto(format!("RSA key generation failed: {err}")))?;
    let rsa_pubs: Vec<RsaPublicKey> = rsa_keys.iter().map(RsaPrivateKey::to_public_key).collect();

    let keys = rsa_keys
        .into_iter()
        .zip(secret_shares)
        .enumerate()
        .map(|(index, (rsa_key, secret_share))| CosignerKey {
            public_key,
            secret_share,
            rsa_key,
            id: index as u8 + 1,
            rsa_pubs: rsa_pubs.clone(),
        })
        .collect();
    Ok((public_key, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cosigner_key_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cosigner.json");
        let (_, keys) = deal_cosigner_keys(2, 3, 1024).unwrap();

        keys[1].save(&path).unwrap();
        let loaded = CosignerKey::load(&path).unwrap();

        assert_eq!(loaded.id, 2);
        assert_eq!(loaded.public_key, keys[1].public_key);
        assert_eq!(loaded.secret_share, keys[1].secret_share);
        assert_eq!(
            loaded.rsa_key.to_pkcs1_der().unwrap().as_bytes(),
            keys[1].rsa_key.to_pkcs1_der().unwrap().as_bytes()
        );
        assert_eq!(loaded.rsa_pubs, keys[1].rsa_pubs);
    }

    #[test]
    fn test_cosigner_key_id_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cosigner.json");
        let (_, mut keys) = deal_cosigner_keys(2, 3, 1024).unwrap();
        keys[0].id = 7;
        keys[0].save(&path).unwrap();
        assert!(CosignerKey::load(&path).is_err());
    }

    #[test]
    fn test_ed25519_key_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("priv_validator_key.json");
        let key = SigningKey::from_bytes(&[42u8; 32]);

        save_ed25519_key(&path, &key).unwrap();
        let loaded = load_ed25519_key(&path).unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());
    }

    #[test]
    fn test_ed25519_key_pubkey_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("priv_validator_key.json");
        let file = PrivValidatorKeyFile {
            pub_key: vec![0u8; 32],
            priv_key: vec![42u8; 32],
        };
        fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).unwrap();
        assert!(load_ed25519_key(&path).is_err());
    }
}

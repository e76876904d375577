//! Scalar-field arithmetic for the m-of-n signing scheme.
//!
//! The long-term secret and every per-round nonce are Shamir-shared over
//! the Ed25519 scalar field: a degree-(m-1) polynomial is evaluated at each
//! cosigner's ID, and any m evaluations recover the constant term through a
//! Lagrange-weighted sum at zero. A cosigner's partial signature is itself
//! such an evaluation, so combining m partials yields a standard Ed25519
//! signature that verifies under the aggregate public key.

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::error::SignerError;

/// Draws a uniformly random nonzero scalar.
pub fn random_scalar() -> Scalar {
    loop {
        let mut wide = [0u8; 64];
        OsRng.fill_bytes(&mut wide);
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        if scalar != Scalar::ZERO {
            return scalar;
        }
    }
}

/// Shamir-splits `secret` so that any `threshold` of the `total` shares
/// recover it. The share for cosigner ID i (1-based) is at index i-1.
pub fn deal_shares(secret: Scalar, threshold: u8, total: u8) -> Vec<Scalar> {
    assert!(threshold >= 1 && threshold <= total, "invalid threshold");

    let mut coefficients = Vec::with_capacity(threshold as usize);
    coefficients.push(secret);
    for _ in 1..threshold {
        coefficients.push(random_scalar());
    }

    (1..=total)
        .map(|id| eval_poly(&coefficients, Scalar::from(id as u64)))
        .collect()
}

fn eval_poly(coefficients: &[Scalar], x: Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Lagrange basis coefficient at zero for `id` within the quorum `ids`.
pub fn lagrange_coefficient(id: u8, ids: &[u8]) -> Scalar {
    let xi = Scalar::from(id as u64);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &other in ids {
        if other == id {
            continue;
        }
        let xj = Scalar::from(other as u64);
        numerator *= xj;
        denominator *= xj - xi;
    }
    numerator * denominator.invert()
}

/// Recovers the shared constant term from `(id, share)` evaluations. The
/// caller is responsible for passing at least a threshold of shares.
pub fn combine_shares(shares: &[(u8, Scalar)]) -> Scalar {
    let ids: Vec<u8> = shares.iter().map(|(id, _)| *id).collect();
    shares
        .iter()
        .fold(Scalar::ZERO, |acc, (id, share)| {
            acc + lagrange_coefficient(*id, &ids) * share
        })
}

/// Compressed public form of `scalar`, i.e. scalar * B.
pub fn scalar_base_mult(scalar: Scalar) -> [u8; 32] {
    (ED25519_BASEPOINT_POINT * scalar).compress().to_bytes()
}

/// Sums compressed curve points, e.g. per-dealer ephemeral public chunks
/// into the combined ephemeral public R.
pub fn sum_points<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Result<[u8; 32], SignerError> {
    let mut sum = EdwardsPoint::identity();
    let mut any = false;
    for chunk in chunks {
        let bytes: [u8; 32] = chunk
            .try_into()
            .map_err(|_| SignerError::Crypto("curve point is not 32 bytes".to_string()))?;
        let point = CompressedEdwardsY(bytes)
            .decompress()
            .ok_or_else(|| SignerError::Crypto("invalid curve point".to_string()))?;
        sum += point;
        any = true;
    }
    if !any {
        return Err(SignerError::Crypto("no curve points to sum".to_string()));
    }
    Ok(sum.compress().to_bytes())
}

/// Standard Ed25519 challenge scalar: SHA-512(R || P || m) reduced mod the
/// group order.
pub fn challenge(ephemeral_public: &[u8; 32], public_key: &[u8; 32], message: &[u8]) -> Scalar {
    let mut hash = Sha512::new();
    hash.update(ephemeral_public);
    hash.update(public_key);
    hash.update(message);
    let digest: [u8; 64] = hash.finalize().into();
    Scalar::from_bytes_mod_order_wide(&digest)
}

/// Decodes a canonically encoded scalar; refuses anything that is not
/// exactly 32 bytes in canonical form.
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, SignerError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SignerError::Crypto("scalar is not 32 bytes".to_string()))?;
    Option::from(Scalar::from_canonical_bytes(array))
        .ok_or_else(|| SignerError::Crypto("non-canonical scalar".to_string()))
}

/// Pairs the combined ephemeral public with the recovered scalar into a
/// 64-byte Ed25519 signature.
pub fn assemble_signature(ephemeral_public: &[u8; 32], s: Scalar) -> [u8; 64] {
    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(ephemeral_public);
    signature[32..].copy_from_slice(&s.to_bytes());
    signature
}

/// Verifies an assembled signature under the validator public key.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignerError> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| SignerError::Crypto("public key is not 32 bytes".to_string()))?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|err| SignerError::Crypto(format!("invalid public key: {err}")))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignerError::Crypto("signature is not 64 bytes".to_string()))?;
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignerError::InvalidCombinedSignature)
}

/// Deals a fresh signing key: returns the aggregate public key and one
/// secret share per cosigner ID. Used by tests and provisioning tooling;
/// production key ceremonies happen outside this process.
pub fn deal_signing_key(threshold: u8, total: u8) -> ([u8; 32], Vec<Scalar>) {
    let secret = random_scalar();
    let public_key = scalar_base_mult(secret);
    (public_key, deal_shares(secret, threshold, total))
}

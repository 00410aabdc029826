mod hash;
mod identity;
mod node_id;

pub mod ecies;
pub mod error;

pub use error::CryptoError;
pub use hash::*;
pub use identity::NodeIdentity;
pub use node_id::*;

/// Re-export the secp256k1 key types used across the stack
pub use k256::ecdsa::{SigningKey, VerifyingKey};

use k256::ecdsa::{RecoveryId, Signature};
use sha2::{Digest as Sha2Digest, Sha256};

pub const SIGNATURE_SIZE: usize = 65; // r(32) ‖ s(32) ‖ recovery id(1)

/// Shared-point x coordinate of an ECDH exchange.
///
/// Only the x coordinate enters the key schedule, matching the wire
/// protocol this stack interoperates with.
pub fn ecdh_x(public: &VerifyingKey, secret: &SigningKey) -> [u8; 32] {
    let shared = k256::ecdh::diffie_hellman(secret.as_nonzero_scalar(), public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    out
}

/// NIST concatenation KDF over SHA-256.
///
/// Produces `len` bytes from `hash(counter_be32 ‖ material)` blocks, with
/// the counter starting at 1.
pub fn concat_kdf(material: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(material);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }

    out.truncate(len);
    out
}

/// Recoverable signature over a 32-byte digest: `r ‖ s ‖ recovery id`.
pub fn sign_recoverable(secret: &SigningKey, digest: &Hash) -> Result<[u8; 65], CryptoError> {
    let (signature, recovery_id) = secret.sign_prehash_recoverable(digest.as_bytes())?;
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recover the signer's public key from a 65-byte recoverable signature.
pub fn recover_public_key(digest: &Hash, signature: &[u8; 65]) -> Result<VerifyingKey, CryptoError> {
    let recovery_id =
        RecoveryId::from_byte(signature[64]).ok_or(CryptoError::InvalidRecoveryId(signature[64]))?;
    let signature = Signature::from_slice(&signature[..64])?;
    Ok(VerifyingKey::recover_from_prehash(
        digest.as_bytes(),
        &signature,
        recovery_id,
    )?)
}

//! Asymmetric message envelope used by the transport handshake.
//!
//! One-time keypair + ECDH + concat-KDF, then AES-128-CTR for secrecy and
//! an HMAC-SHA256 tag for integrity:
//!
//! `once_public(65) ‖ iv(16) ‖ ciphertext ‖ tag(32)`
//!
//! The tag covers `iv ‖ ciphertext` under `sha256(kdf[16..32])`; the
//! cipher key is `kdf[..16]`. The one-time key is never reused, so a
//! fixed all-zero IV is sound here.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::{concat_kdf, ecdh_x, CryptoError};

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Uncompressed SEC1 public key size.
pub const PUBLIC_KEY_SIZE: usize = 65;
/// IV size of the embedded stream cipher.
pub const IV_SIZE: usize = 16;
/// HMAC-SHA256 tag size.
pub const TAG_SIZE: usize = 32;
/// Bytes added around the plaintext by the envelope.
pub const OVERHEAD: usize = PUBLIC_KEY_SIZE + IV_SIZE + TAG_SIZE;

/// Encrypt `plaintext` to the holder of `remote_public`.
pub fn encrypt_message(
    remote_public: &VerifyingKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let once_secret = SigningKey::random(&mut OsRng);
    let x = ecdh_x(remote_public, &once_secret);
    let key = concat_kdf(&x, 32);

    let mut ekey = [0u8; 16];
    ekey.copy_from_slice(&key[..16]);
    let mkey = Sha256::digest(&key[16..32]);

    let iv = [0u8; IV_SIZE];
    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new((&ekey).into(), (&iv).into());
    cipher.apply_keystream(&mut ciphertext);

    let mut out = Vec::with_capacity(OVERHEAD + plaintext.len());
    out.extend_from_slice(
        once_secret
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes(),
    );
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(&mkey)?;
    mac.update(&out[PUBLIC_KEY_SIZE..]);
    out.extend_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Decrypt an envelope addressed to `secret`.
///
/// The tag is verified (constant time) before anything is decrypted.
pub fn decrypt_message(secret: &SigningKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < OVERHEAD {
        return Err(CryptoError::InvalidLength(OVERHEAD, data.len()));
    }

    let once_public = VerifyingKey::from_sec1_bytes(&data[..PUBLIC_KEY_SIZE])?;
    let (data_iv, tag) = data[PUBLIC_KEY_SIZE..].split_at(data.len() - PUBLIC_KEY_SIZE - TAG_SIZE);

    let x = ecdh_x(&once_public, secret);
    let key = concat_kdf(&x, 32);

    let mut ekey = [0u8; 16];
    ekey.copy_from_slice(&key[..16]);
    let mkey = Sha256::digest(&key[16..32]);

    let mut mac = HmacSha256::new_from_slice(&mkey)?;
    mac.update(data_iv);
    mac.verify_slice(tag).map_err(|_| CryptoError::InvalidTag)?;

    let (iv, encrypted) = data_iv.split_at(IV_SIZE);
    let mut iv_bytes = [0u8; IV_SIZE];
    iv_bytes.copy_from_slice(iv);

    let mut out = encrypted.to_vec();
    let mut cipher = Aes128Ctr::new((&ekey).into(), (&iv_bytes).into());
    cipher.apply_keystream(&mut out);
    Ok(out)
}

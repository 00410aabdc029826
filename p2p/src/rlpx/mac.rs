//! Running MAC over the framed transport.
//!
//! A Keccak-256 sponge whose current digest, truncated to 16 bytes,
//! authenticates each header and body. Every absorption step mixes the
//! previous digest through AES-256-ECB under the shared MAC secret, so
//! each frame's tag commits to the whole connection history.

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes256,
};
use sha3::{Digest, Keccak256};

use kadmos_common::crypto::Hash;

/// Truncated digest size appended to headers and bodies.
pub const MAC_SIZE: usize = 16;

pub struct FrameMac {
    sponge: Keccak256,
    cipher: Aes256,
}

impl FrameMac {
    /// Build a MAC keyed by `secret`, absorbing the seed parts immediately.
    ///
    /// The seed is `(mac_secret XOR peer_nonce) ‖ handshake_ciphertext`,
    /// which makes the two directions of a connection distinct from the
    /// first byte.
    pub fn new(secret: &Hash, seed: &[&[u8]]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(secret.as_bytes()));
        let mut sponge = Keccak256::new();
        for part in seed {
            sponge.update(part);
        }
        Self { sponge, cipher }
    }

    /// Current digest: the first 16 bytes of the sponge state.
    pub fn digest(&self) -> [u8; MAC_SIZE] {
        let full = self.sponge.clone().finalize();
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&full[..MAC_SIZE]);
        out
    }

    /// Absorb an encrypted header block; returns the tag covering it.
    pub fn update_header(&mut self, data: &[u8; MAC_SIZE]) -> [u8; MAC_SIZE] {
        let mut block = self.digest();
        self.encrypt_block(&mut block);
        for (b, d) in block.iter_mut().zip(data.iter()) {
            *b ^= d;
        }
        self.sponge.update(block);
        self.digest()
    }

    /// Absorb an encrypted body; returns the tag covering it.
    pub fn update_body(&mut self, data: &[u8]) -> [u8; MAC_SIZE] {
        self.sponge.update(data);
        let prev = self.digest();
        let mut block = prev;
        self.encrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        self.sponge.update(block);
        self.digest()
    }

    fn encrypt_block(&self, block: &mut [u8; MAC_SIZE]) {
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(block));
    }
}

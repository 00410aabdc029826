use thiserror::Error;

/// Errors from the cryptographic primitives.
///
/// Every failure here is attributable to malformed or tampered input;
/// callers treat them as fatal for the message or connection at hand.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Input shorter or longer than the format requires
    #[error("Invalid message length: expected {0} bytes, got {1}")]
    InvalidLength(usize, usize),

    /// HMAC authentication tag mismatch
    #[error("Authentication tag mismatch")]
    InvalidTag,

    /// Recovery id byte outside 0..=3
    #[error("Invalid signature recovery id: {0}")]
    InvalidRecoveryId(u8),

    /// Signature or key rejected by the curve implementation
    #[error("Signature error: {0}")]
    Signature(#[from] k256::ecdsa::Error),

    /// MAC keying error
    #[error("Invalid mac key: {0}")]
    MacKey(#[from] hmac::digest::InvalidLength),
}

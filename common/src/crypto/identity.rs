use std::fmt::{self, Debug, Formatter};

use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use super::{CryptoError, Hash, NodeId};

/// The static secp256k1 keypair identifying a node.
///
/// The node id is derived from the public key and cached; the secret key
/// signs discovery packets and drives the transport handshake.
#[derive(Clone)]
pub struct NodeIdentity {
    secret: SigningKey,
    public: VerifyingKey,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Build an identity from an existing signing key.
    pub fn from_signing_key(secret: SigningKey) -> Self {
        let public = secret.verifying_key().clone();
        let node_id = NodeId::from_public_key(&public);
        Self {
            secret,
            public,
            node_id,
        }
    }

    /// Build an identity from raw secret bytes (32 bytes, big-endian scalar).
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = SigningKey::from_bytes(bytes.into())?;
        Ok(Self::from_signing_key(secret))
    }

    pub fn secret(&self) -> &SigningKey {
        &self.secret
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Recoverable signature over a 32-byte digest.
    pub fn sign_recoverable(&self, digest: &Hash) -> Result<[u8; 65], CryptoError> {
        super::sign_recoverable(&self.secret, digest)
    }
}

// Never expose the secret key through Debug
impl Debug for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({})", self.node_id)
    }
}

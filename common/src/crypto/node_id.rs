use k256::ecdsa::VerifyingKey;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use std::{
    convert::{TryFrom, TryInto},
    fmt::{Display, Error, Formatter},
    str::FromStr,
};

use super::CryptoError;

pub const NODE_ID_SIZE: usize = 64; // uncompressed public key without the SEC1 prefix

// A node identity: the 64-byte uncompressed secp256k1 public key with its
// 0x04 format prefix stripped. Used as the routing-table key and as the
// connection identity.
#[derive(Eq, PartialEq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; NODE_ID_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    // Strip the 0x04 prefix from the uncompressed SEC1 encoding
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let mut bytes = [0; NODE_ID_SIZE];
        bytes.copy_from_slice(&point.as_bytes()[1..]);
        NodeId(bytes)
    }

    // Rebuild the public key by prepending the 0x04 prefix.
    // Fails if the bytes are not a valid curve point.
    pub fn to_public_key(&self) -> Result<VerifyingKey, CryptoError> {
        let mut sec1 = [0u8; NODE_ID_SIZE + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(&self.0);
        Ok(VerifyingKey::from_sec1_bytes(&sec1)?)
    }
}

impl FromStr for NodeId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| "Invalid hex string")?;
        let bytes: [u8; NODE_ID_SIZE] = bytes.try_into().map_err(|_| "Invalid node id")?;
        Ok(NodeId::new(bytes))
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = &'static str;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; NODE_ID_SIZE] = bytes.try_into().map_err(|_| "Invalid node id length")?;
        Ok(NodeId::new(bytes))
    }
}

impl From<&VerifyingKey> for NodeId {
    fn from(key: &VerifyingKey) -> Self {
        NodeId::from_public_key(key)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", &self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != NODE_ID_SIZE * 2 {
            return Err(SerdeError::custom("Invalid hex length"));
        }

        NodeId::from_str(&hex).map_err(SerdeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeIdentity;

    #[test]
    fn test_public_key_round_trip() {
        let identity = NodeIdentity::generate();
        let id = identity.node_id().clone();

        let key = id.to_public_key().unwrap();
        assert_eq!(NodeId::from_public_key(&key), id);
    }

    #[test]
    fn test_invalid_point_rejected() {
        // Not a curve point
        let id = NodeId::new([0xff; NODE_ID_SIZE]);
        assert!(id.to_public_key().is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let identity = NodeIdentity::generate();
        let id = identity.node_id().clone();
        let parsed = NodeId::from_str(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }
}

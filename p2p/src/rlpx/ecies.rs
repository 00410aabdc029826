//! ECIES handshake session and frame cipher state.
//!
//! The initiator sends a 307-byte Auth packet, the responder answers with a
//! 210-byte Ack. Both sides then derive the frame secrets and switch to
//! encrypted, MAC'd 16-byte-aligned frames. After the handshake the session
//! splits into an ingress and an egress half so the read and write tasks
//! can each own their stream cursor and running MAC.

use std::sync::Arc;

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::{rngs::OsRng, RngCore};

use kadmos_common::crypto::{
    ecdh_x, ecies, keccak256, keccak256_concat, recover_public_key, sign_recoverable, Hash, NodeId,
    NodeIdentity, SigningKey, VerifyingKey, HASH_SIZE, NODE_ID_SIZE, SIGNATURE_SIZE,
};

use crate::{
    config::MAX_FRAME_BODY_SIZE,
    error::{FramingError, HandshakeError, P2pResult},
    rlpx::mac::{FrameMac, MAC_SIZE},
};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Auth plaintext: `sig(65) ‖ ephemeral_id_hash(32) ‖ id(64) ‖ nonce(32) ‖ 0x00`.
const AUTH_PLAINTEXT_SIZE: usize = SIGNATURE_SIZE + HASH_SIZE + NODE_ID_SIZE + HASH_SIZE + 1;
/// Ack plaintext: `ephemeral_id(64) ‖ nonce(32) ‖ 0x00`.
const ACK_PLAINTEXT_SIZE: usize = NODE_ID_SIZE + HASH_SIZE + 1;

/// Size of the Auth packet on the wire (307 bytes).
pub const AUTH_PACKET_SIZE: usize = ecies::OVERHEAD + AUTH_PLAINTEXT_SIZE;
/// Size of the Ack packet on the wire (210 bytes).
pub const ACK_PACKET_SIZE: usize = ecies::OVERHEAD + ACK_PLAINTEXT_SIZE;

/// Encrypted frame header size: 16 cipher bytes plus the 16-byte tag.
pub const HEADER_SIZE: usize = 16 + MAC_SIZE;

/// Bytes a body frame occupies on the wire for a given payload size.
pub fn body_wire_size(size: usize) -> usize {
    padded_size(size) + MAC_SIZE
}

fn padded_size(size: usize) -> usize {
    (size + 15) / 16 * 16
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, o) in out.iter_mut().enumerate() {
        *o = a[i] ^ b[i];
    }
    out
}

/// Outbound half of the frame cipher state.
pub struct FrameEgress {
    aes: Aes256Ctr,
    mac: FrameMac,
}

impl FrameEgress {
    /// Encrypt and authenticate a frame header announcing `size` body bytes.
    pub fn create_header(&mut self, size: usize) -> P2pResult<[u8; HEADER_SIZE]> {
        // The size field is 3 bytes, so the cap can never exceed 2^24 - 1.
        if size > MAX_FRAME_BODY_SIZE || size > 0xff_ff_ff {
            return Err(FramingError::InvalidBodySize(size, MAX_FRAME_BODY_SIZE).into());
        }

        let mut block = [0u8; 16];
        block[0] = (size >> 16) as u8;
        block[1] = (size >> 8) as u8;
        block[2] = size as u8;
        // Placeholder header metadata, fixed since protocol version 4.
        block[3] = 0xc2;
        block[4] = 0x80;
        block[5] = 0x80;

        self.aes.apply_keystream(&mut block);
        let tag = self.mac.update_header(&block);

        let mut out = [0u8; HEADER_SIZE];
        out[..16].copy_from_slice(&block);
        out[16..].copy_from_slice(&tag);
        Ok(out)
    }

    /// Encrypt and authenticate a frame body (padded to a 16 multiple).
    pub fn create_body(&mut self, data: &[u8]) -> P2pResult<Vec<u8>> {
        let mut body = vec![0u8; padded_size(data.len())];
        body[..data.len()].copy_from_slice(data);

        self.aes.apply_keystream(&mut body);
        let tag = self.mac.update_body(&body);
        body.extend_from_slice(&tag);
        Ok(body)
    }
}

/// Inbound half of the frame cipher state.
pub struct FrameIngress {
    aes: Aes256Ctr,
    mac: FrameMac,
    // Declared size the next parse_body call must match.
    body_size: Option<usize>,
}

impl FrameIngress {
    /// Verify and decrypt a frame header; returns the announced body size.
    pub fn parse_header(&mut self, data: &[u8; HEADER_SIZE]) -> P2pResult<usize> {
        let mut block = [0u8; 16];
        block.copy_from_slice(&data[..16]);

        let expected = self.mac.update_header(&block);
        if expected != data[16..] {
            return Err(FramingError::HeaderMacMismatch.into());
        }

        self.aes.apply_keystream(&mut block);

        let size = ((block[0] as usize) << 16) | ((block[1] as usize) << 8) | block[2] as usize;
        if size > MAX_FRAME_BODY_SIZE {
            return Err(FramingError::InvalidBodySize(size, MAX_FRAME_BODY_SIZE).into());
        }
        self.body_size = Some(size);
        Ok(size)
    }

    /// Verify and decrypt a frame body, truncated to the header's size.
    pub fn parse_body(&mut self, data: &[u8]) -> P2pResult<Vec<u8>> {
        let size = self
            .body_size
            .take()
            .ok_or(FramingError::BodyBeforeHeader)?;
        let expected_len = body_wire_size(size);
        if data.len() != expected_len {
            return Err(FramingError::InvalidBodySize(data.len(), expected_len).into());
        }

        let (ciphertext, tag) = data.split_at(data.len() - MAC_SIZE);
        let expected = self.mac.update_body(ciphertext);
        if expected != tag {
            return Err(FramingError::BodyMacMismatch.into());
        }

        let mut body = ciphertext.to_vec();
        self.aes.apply_keystream(&mut body);
        body.truncate(size);
        Ok(body)
    }
}

pub struct EciesSession {
    identity: Arc<NodeIdentity>,
    initiator: bool,
    ephemeral: SigningKey,
    nonce: Hash,
    remote_id: Option<NodeId>,
    remote_ephemeral: Option<VerifyingKey>,
    remote_nonce: Option<Hash>,
    // Raw handshake packets, kept to seed the frame MACs.
    auth_ciphertext: Vec<u8>,
    ack_ciphertext: Vec<u8>,
    ingress: Option<FrameIngress>,
    egress: Option<FrameEgress>,
}

impl EciesSession {
    /// Session for the dialing side, which knows the remote id up front.
    pub fn initiator(identity: Arc<NodeIdentity>, remote_id: NodeId) -> Self {
        Self::new(identity, true, Some(remote_id))
    }

    /// Session for the listening side; the remote id arrives in the Auth.
    pub fn responder(identity: Arc<NodeIdentity>) -> Self {
        Self::new(identity, false, None)
    }

    fn new(identity: Arc<NodeIdentity>, initiator: bool, remote_id: Option<NodeId>) -> Self {
        let mut nonce = [0u8; HASH_SIZE];
        OsRng.fill_bytes(&mut nonce);

        Self {
            identity,
            initiator,
            ephemeral: SigningKey::random(&mut OsRng),
            nonce: Hash::new(nonce),
            remote_id,
            remote_ephemeral: None,
            remote_nonce: None,
            auth_ciphertext: Vec::new(),
            ack_ciphertext: Vec::new(),
            ingress: None,
            egress: None,
        }
    }

    /// Identity of the other side, once known.
    pub fn remote_id(&self) -> Option<&NodeId> {
        self.remote_id.as_ref()
    }

    /// Whether the frame secrets have been derived.
    pub fn is_ready(&self) -> bool {
        self.ingress.is_some()
    }

    /// Consume the session into the remote identity and the two frame
    /// cipher halves. Fails if the handshake did not complete.
    pub fn split(self) -> Result<(NodeId, FrameIngress, FrameEgress), HandshakeError> {
        match (self.remote_id, self.ingress, self.egress) {
            (Some(remote_id), Some(ingress), Some(egress)) => Ok((remote_id, ingress, egress)),
            _ => Err(HandshakeError::Incomplete),
        }
    }

    /// Build the Auth packet (initiator only).
    ///
    /// The signature is made with the ephemeral key over
    /// `ecdh_x(remote_static, local_static) XOR nonce`, which lets the
    /// responder recover our ephemeral public key without it ever being
    /// sent in the clear.
    pub fn create_auth(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let remote_id = self.remote_id.as_ref().ok_or(HandshakeError::Incomplete)?;
        let remote_public = remote_id.to_public_key()?;

        let x = ecdh_x(&remote_public, self.identity.secret());
        let digest = Hash::new(xor32(&x, self.nonce.as_bytes()));
        let signature = sign_recoverable(&self.ephemeral, &digest)?;
        let ephemeral_id = NodeId::from_public_key(self.ephemeral.verifying_key());

        let mut plaintext = Vec::with_capacity(AUTH_PLAINTEXT_SIZE);
        plaintext.extend_from_slice(&signature);
        plaintext.extend_from_slice(keccak256(ephemeral_id.as_bytes()).as_bytes());
        plaintext.extend_from_slice(self.identity.node_id().as_bytes());
        plaintext.extend_from_slice(self.nonce.as_bytes());
        plaintext.push(0x00);

        let packet = ecies::encrypt_message(&remote_public, &plaintext)?;
        self.auth_ciphertext = packet.clone();
        Ok(packet)
    }

    /// Parse an Auth packet (responder only), learning the remote identity
    /// and its ephemeral key.
    pub fn parse_auth(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        if data.len() != AUTH_PACKET_SIZE {
            return Err(HandshakeError::InvalidAuthSize(data.len()));
        }

        let plaintext = ecies::decrypt_message(self.identity.secret(), data)?;
        if plaintext.len() != AUTH_PLAINTEXT_SIZE {
            return Err(HandshakeError::InvalidAuthSize(plaintext.len()));
        }
        if plaintext[AUTH_PLAINTEXT_SIZE - 1] != 0x00 {
            return Err(HandshakeError::TrailingByte);
        }

        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&plaintext[..SIGNATURE_SIZE]);
        let ephemeral_hash = &plaintext[SIGNATURE_SIZE..SIGNATURE_SIZE + HASH_SIZE];

        let id_start = SIGNATURE_SIZE + HASH_SIZE;
        let mut id_bytes = [0u8; NODE_ID_SIZE];
        id_bytes.copy_from_slice(&plaintext[id_start..id_start + NODE_ID_SIZE]);
        let remote_id = NodeId::new(id_bytes);

        let nonce_start = id_start + NODE_ID_SIZE;
        let mut nonce_bytes = [0u8; HASH_SIZE];
        nonce_bytes.copy_from_slice(&plaintext[nonce_start..nonce_start + HASH_SIZE]);
        let remote_nonce = Hash::new(nonce_bytes);

        // Undo the nonce mask and recover the ephemeral key from the
        // signature, then check it against the transmitted hash.
        let remote_public = remote_id.to_public_key()?;
        let x = ecdh_x(&remote_public, self.identity.secret());
        let digest = Hash::new(xor32(&x, remote_nonce.as_bytes()));
        let remote_ephemeral = recover_public_key(&digest, &signature)?;

        let recovered_id = NodeId::from_public_key(&remote_ephemeral);
        if keccak256(recovered_id.as_bytes()).as_bytes() != ephemeral_hash {
            return Err(HandshakeError::EphemeralHashMismatch);
        }

        self.remote_id = Some(remote_id);
        self.remote_nonce = Some(remote_nonce);
        self.remote_ephemeral = Some(remote_ephemeral);
        self.auth_ciphertext = data.to_vec();
        Ok(())
    }

    /// Build the Ack packet (responder only) and derive the frame secrets.
    pub fn create_ack(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let remote_id = self.remote_id.as_ref().ok_or(HandshakeError::Incomplete)?;
        let remote_public = remote_id.to_public_key()?;

        let ephemeral_id = NodeId::from_public_key(self.ephemeral.verifying_key());
        let mut plaintext = Vec::with_capacity(ACK_PLAINTEXT_SIZE);
        plaintext.extend_from_slice(ephemeral_id.as_bytes());
        plaintext.extend_from_slice(self.nonce.as_bytes());
        plaintext.push(0x00);

        let packet = ecies::encrypt_message(&remote_public, &plaintext)?;
        self.ack_ciphertext = packet.clone();
        self.setup_frame()?;
        Ok(packet)
    }

    /// Parse an Ack packet (initiator only) and derive the frame secrets.
    pub fn parse_ack(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        if data.len() != ACK_PACKET_SIZE {
            return Err(HandshakeError::InvalidAckSize(data.len()));
        }

        let plaintext = ecies::decrypt_message(self.identity.secret(), data)?;
        if plaintext.len() != ACK_PLAINTEXT_SIZE {
            return Err(HandshakeError::InvalidAckSize(plaintext.len()));
        }
        if plaintext[ACK_PLAINTEXT_SIZE - 1] != 0x00 {
            return Err(HandshakeError::TrailingByte);
        }

        let mut id_bytes = [0u8; NODE_ID_SIZE];
        id_bytes.copy_from_slice(&plaintext[..NODE_ID_SIZE]);
        let mut nonce_bytes = [0u8; HASH_SIZE];
        nonce_bytes.copy_from_slice(&plaintext[NODE_ID_SIZE..NODE_ID_SIZE + HASH_SIZE]);

        self.remote_ephemeral = Some(NodeId::new(id_bytes).to_public_key()?);
        self.remote_nonce = Some(Hash::new(nonce_bytes));
        self.ack_ciphertext = data.to_vec();
        self.setup_frame()?;
        Ok(())
    }

    // Frame key schedule. Everything hangs off the ephemeral-ephemeral
    // shared secret, so a leaked static key never exposes recorded traffic.
    fn setup_frame(&mut self) -> Result<(), HandshakeError> {
        let remote_ephemeral = self
            .remote_ephemeral
            .as_ref()
            .ok_or(HandshakeError::Incomplete)?;
        let remote_nonce = self.remote_nonce.clone().ok_or(HandshakeError::Incomplete)?;

        let eph = ecdh_x(remote_ephemeral, &self.ephemeral);
        // Nonce order is fixed by role: responder's first.
        let h_nonce = if self.initiator {
            keccak256_concat(&[remote_nonce.as_bytes(), self.nonce.as_bytes()])
        } else {
            keccak256_concat(&[self.nonce.as_bytes(), remote_nonce.as_bytes()])
        };
        let shared = keccak256_concat(&[&eph, h_nonce.as_bytes()]);
        let aes_secret = keccak256_concat(&[&eph, shared.as_bytes()]);
        let mac_secret = keccak256_concat(&[&eph, aes_secret.as_bytes()]);

        let iv = [0u8; 16];
        let (own_sent, received) = if self.initiator {
            (&self.auth_ciphertext, &self.ack_ciphertext)
        } else {
            (&self.ack_ciphertext, &self.auth_ciphertext)
        };
        let egress_seed = xor32(mac_secret.as_bytes(), remote_nonce.as_bytes());
        let ingress_seed = xor32(mac_secret.as_bytes(), self.nonce.as_bytes());

        self.egress = Some(FrameEgress {
            aes: Aes256Ctr::new(aes_secret.as_bytes().into(), (&iv).into()),
            mac: FrameMac::new(&mac_secret, &[&egress_seed, own_sent]),
        });
        self.ingress = Some(FrameIngress {
            aes: Aes256Ctr::new(aes_secret.as_bytes().into(), (&iv).into()),
            mac: FrameMac::new(&mac_secret, &[&ingress_seed, received]),
            body_size: None,
        });
        Ok(())
    }
}

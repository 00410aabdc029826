//! Peer-to-peer networking: Kademlia-style node discovery over UDP and an
//! encrypted, capability-multiplexed transport over TCP.

pub mod config;
pub mod dpt;
pub mod error;
pub mod rlpx;

pub use self::{
    config::{DptConfig, RlpxConfig},
    dpt::{Dpt, DptEvent, Endpoint, PeerRecord},
    error::{P2pError, P2pResult},
    rlpx::{Capability, DisconnectReason, Peer, Rlpx, RlpxEvent},
};

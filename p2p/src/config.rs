//! Protocol constants and runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rlpx::Capability;

// Kademlia parameters
// K: entries per bucket, also the fan-out of NEIGHBOURS answers
pub const BUCKET_SIZE: usize = 16;
// One bucket per bit of the 512-bit id space
pub const NUM_BUCKETS: usize = 512;
// C: how many stale entries get probed when a bucket is full
pub const EVICTION_PROBES: usize = 3;

// Discovery wire protocol
pub const DPT_PROTOCOL_VERSION: u8 = 0x04;
// Senders postmark packets this far into the future as an expiry marker
pub const PACKET_EXPIRY_WINDOW: u64 = 60;
// Reject packets postmarked unreasonably far ahead (clock drift bound)
pub const PACKET_MAX_CLOCK_DRIFT: u64 = 300;
// Conservative IPv6-safe payload budget per datagram
pub const MAX_DATAGRAM_SIZE: usize = 1280;
// NEIGHBOURS answers are chunked to stay under the datagram budget
pub const NEIGHBOURS_MAX_PER_PACKET: usize = 12;

// Discovery timers
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const BAN_DURATION: Duration = Duration::from_secs(5 * 60);
// Concurrent pings to one address within this window share a round trip
pub const PING_DEDUP_TTL: Duration = Duration::from_secs(1);
pub const PING_DEDUP_CAPACITY: usize = 1000;
// Unsolicited senders are re-pinged after this delay before being trusted
pub const PENDING_ADD_DELAY: Duration = Duration::from_millis(50);
// Hard cap per pending-request map; stale slots are pruned at the cap
pub const MAX_PENDING_REQUESTS: usize = 512;
pub const BAN_LIST_CAPACITY: usize = 30_000;
// Manager event broadcast channels; slow subscribers lose oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// Base transport protocol
pub const BASE_PROTOCOL_VERSION: u32 = 4;
// Message codes 0..16 are reserved; capability ranges start after them
pub const BASE_PROTOCOL_LENGTH: u8 = 16;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
// Written DISCONNECTs get this long to flush before the socket closes
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
// Upper bound on a single frame body, to bound per-connection memory
pub const MAX_FRAME_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_PEERS: usize = 10;
// Outbound frames queued per connection before senders block
pub const PEER_WRITE_CHANNEL_SIZE: usize = 1024;
// Inbound messages queued per capability before the read loop blocks
pub const CAPABILITY_CHANNEL_SIZE: usize = 256;

const fn default_max_peers() -> usize {
    DEFAULT_MAX_PEERS
}

const fn default_handshake_timeout_secs() -> u64 {
    HANDSHAKE_TIMEOUT.as_secs()
}

const fn default_ping_interval_secs() -> u64 {
    PING_INTERVAL.as_secs()
}

fn default_client_id() -> String {
    format!(
        "kadmos/v{}/{}-{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Configuration of the transport manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlpxConfig {
    /// Maximum established + in-handshake connections.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Client identifier advertised in the HELLO message.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Capabilities offered to every peer.
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// TCP port advertised in the HELLO message, if listening.
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Socket connect / handshake / pong deadline, in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub timeout_secs: u64,

    /// Liveness ping interval, in seconds.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for RlpxConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            client_id: default_client_id(),
            capabilities: Vec::new(),
            listen_port: None,
            timeout_secs: default_handshake_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl RlpxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

const fn default_request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT.as_secs()
}

const fn default_refresh_interval_secs() -> u64 {
    REFRESH_INTERVAL.as_secs()
}

const fn default_ban_duration_secs() -> u64 {
    BAN_DURATION.as_secs()
}

/// Configuration of the discovery manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DptConfig {
    /// UDP endpoint advertised to other nodes, when it differs from the
    /// bound address (e.g. behind a known static mapping).
    #[serde(default)]
    pub advertised_udp_port: Option<u16>,

    /// TCP port advertised in PING packets for the transport layer.
    #[serde(default)]
    pub advertised_tcp_port: Option<u16>,

    /// Round-trip deadline for PING and FINDNEIGHBOURS requests, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Interval of the random-target table refresh, in seconds.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// How long misbehaving or unreachable peers stay banned, in seconds.
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,
}

impl Default for DptConfig {
    fn default() -> Self {
        Self {
            advertised_udp_port: None,
            advertised_tcp_port: None,
            request_timeout_secs: default_request_timeout_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            ban_duration_secs: default_ban_duration_secs(),
        }
    }
}

impl DptConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

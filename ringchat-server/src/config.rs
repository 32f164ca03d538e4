use std::net::Ipv4Addr;
use std::time::Duration;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);
pub const MULTICAST_PORT: u16 = 5000;
pub const MULTICAST_TTL: u32 = 2;

/// Cadence of the discovery beacon.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);
/// Time a freshly started node listens before seeding its ring.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

pub const RING_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const RING_READY_POLL: Duration = Duration::from_millis(500);

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// Three missed heartbeats declare a peer crashed.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(6);

pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Pacing applied before every ballot or announcement forward.
pub const ELECTION_MESSAGE_DELAY: Duration = Duration::from_millis(500);
/// Grace before replaying a ballot that arrived while the ring had no
/// right neighbor yet.
pub const ELECTION_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const ELECTION_RESTART_DELAY: Duration = Duration::from_secs(1);
/// Pause between a multi-node startup and the initial election.
pub const ELECTION_STARTUP_DELAY: Duration = Duration::from_secs(2);

/// A client must send CLIENT_JOIN within this window or the socket closes.
pub const CLIENT_JOIN_DEADLINE: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

pub const HISTORY_LIMIT: usize = 1000;
/// How much of the history a newly joined client receives.
pub const HISTORY_TAIL: usize = 50;

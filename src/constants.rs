//! Protocol constants and tuning parameters.
//!
//! Defaults follow the Mainline DHT conventions (BEP-5) and the usual
//! metadata-exchange limits; the crawl-specific overrides live in
//! [`crate::dht::Config::crawl`].

use std::time::Duration;

// ============================================================================
// DHT protocol
// ============================================================================

/// Replication factor. Nodes per bucket and neighbors returned.
pub const K: usize = 8;

/// Length of a node id / info hash in bytes.
pub const ID_LEN: usize = 20;

/// Length of a node id in bits.
pub const ID_BITS: usize = 160;

/// Compact IP/port endpoint length (4-byte IPv4 + 2-byte port).
pub const COMPACT_ADDR_LEN: usize = 6;

/// Compact node info length (20-byte id + endpoint).
pub const COMPACT_NODE_LEN: usize = 26;

/// Default UDP bind address.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:6880";

/// Well-known bootstrap routers.
pub const PRIME_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

// ============================================================================
// Timeouts and periods
// ============================================================================

/// A node not heard from for this long is pinged by the bucket refresh.
pub const NODE_EXPIRED_AFTER: Duration = Duration::from_secs(15 * 60);

/// A bucket unchanged for this long is refreshed with a find_node lookup.
pub const KBUCKET_EXPIRED_AFTER: Duration = Duration::from_secs(15 * 60);

/// How often the routing table is scanned for stale buckets.
pub const CHECK_KBUCKET_PERIOD: Duration = Duration::from_secs(30);

/// get_peers tokens are valid for this long.
pub const TOKEN_EXPIRED_AFTER: Duration = Duration::from_secs(10 * 60);

/// How often expired tokens are swept out.
pub const TOKEN_CLEAR_PERIOD: Duration = Duration::from_secs(3 * 60);

/// UDP write deadline and per-attempt response wait for outbound queries.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Bounds
// ============================================================================

/// Transaction ids wrap at this cursor value (encoded in at most 4 bytes).
pub const MAX_TRANSACTION_CURSOR: u64 = u32::MAX as u64;

/// Maximum nodes the routing table will hold.
pub const MAX_NODES: usize = 5000;

/// Maximum blacklist entries before the oldest is evicted.
pub const BLACKLIST_MAX_SIZE: usize = 65536;

/// Total attempts per outbound query.
pub const QUERY_TRY: usize = 2;

/// Outbound query channel depth.
pub const PACKET_JOB_LIMIT: usize = 1024;

/// Concurrent inbound packet handlers; packets beyond this are dropped.
pub const PACKET_WORKER_LIMIT: usize = 256;

/// Nodes per stale bucket that get a refresh find_node.
pub const REFRESH_NODE_NUM: usize = 8;

/// Token payload length in bytes.
pub const TOKEN_LEN: usize = 5;

// ============================================================================
// Metadata fetcher
// ============================================================================

/// ut_metadata piece size (BEP-9).
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Absolute cap on metadata_size advertised by a peer.
pub const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

/// Deadline for one complete metadata fetch session.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Default fetcher worker count.
pub const WIRE_WORKER_LIMIT: usize = 256;

/// Default fetch request queue depth.
pub const WIRE_REQUEST_QUEUE: usize = 1024;

/// Default fetched-metadata channel capacity.
pub const WIRE_RESPONSE_BUF: usize = 1024;

/// Bound on the fetcher's failed-endpoint blacklist.
pub const WIRE_BLACKLIST_SIZE: usize = 65536;

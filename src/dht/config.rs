use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::node::Peer;
use crate::constants;
use crate::torrent::InfoHash;

/// How the node participates in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A well-behaved BEP-5 node.
    Standard,
    /// A harvester: one giant bucket, no aging, aggressive churn.
    Crawl,
}

/// Callback fired for every `get_peers` request observed.
pub type GetPeersHook = Arc<dyn Fn(InfoHash, IpAddr, u16) + Send + Sync>;

/// Callback fired for every peer carried in a `get_peers` response.
pub type GetPeersResponseHook = Arc<dyn Fn(InfoHash, Peer) + Send + Sync>;

/// Callback fired for every token-verified `announce_peer` request. The
/// crawler's primary fan-out into the metadata fetcher.
pub type AnnouncePeerHook = Arc<dyn Fn(InfoHash, IpAddr, u16) + Send + Sync>;

/// Host-application callbacks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_get_peers: Option<GetPeersHook>,
    pub on_get_peers_response: Option<GetPeersResponseHook>,
    pub on_announce_peer: Option<AnnouncePeerHook>,
}

/// DHT node configuration.
#[derive(Clone)]
pub struct Config {
    /// Replication factor; neighbors returned from lookups.
    pub k: usize,
    /// Bucket capacity. Crawl mode uses one unbounded bucket.
    pub kbucket_size: usize,
    /// Address family; only "udp4" is supported.
    pub network: String,
    /// UDP bind address.
    pub address: String,
    /// Bootstrap routers, resolved at startup.
    pub prime_nodes: Vec<String>,
    /// Node inactivity threshold before a refresh ping.
    pub node_expired_after: Duration,
    /// Bucket inactivity threshold before a refresh lookup.
    pub kbucket_expired_after: Duration,
    /// Period of the refresh scan.
    pub check_kbucket_period: Duration,
    /// Token lifetime.
    pub token_expired_after: Duration,
    /// Transaction id cursor wraps at this value.
    pub max_transaction_cursor: u64,
    /// Routing table capacity.
    pub max_nodes: usize,
    /// Endpoints blacklisted (wildcard port) at startup.
    pub blocked_ips: Vec<IpAddr>,
    /// Blacklist capacity.
    pub blacklist_max_size: usize,
    pub mode: Mode,
    /// Total attempts per outbound query.
    pub try_times: usize,
    /// Outbound query channel depth.
    pub packet_job_limit: usize,
    /// Concurrent inbound packet handlers.
    pub packet_worker_limit: usize,
    /// Nodes refreshed per stale bucket.
    pub refresh_node_num: usize,
    pub hooks: Hooks,
}

impl Config {
    /// Defaults for a standard, well-behaved node.
    pub fn standard() -> Self {
        Self {
            k: constants::K,
            kbucket_size: constants::K,
            network: "udp4".to_string(),
            address: constants::DEFAULT_ADDRESS.to_string(),
            prime_nodes: constants::PRIME_NODES.iter().map(|s| s.to_string()).collect(),
            node_expired_after: constants::NODE_EXPIRED_AFTER,
            kbucket_expired_after: constants::KBUCKET_EXPIRED_AFTER,
            check_kbucket_period: constants::CHECK_KBUCKET_PERIOD,
            token_expired_after: constants::TOKEN_EXPIRED_AFTER,
            max_transaction_cursor: constants::MAX_TRANSACTION_CURSOR,
            max_nodes: constants::MAX_NODES,
            blocked_ips: Vec::new(),
            blacklist_max_size: constants::BLACKLIST_MAX_SIZE,
            mode: Mode::Standard,
            try_times: constants::QUERY_TRY,
            packet_job_limit: constants::PACKET_JOB_LIMIT,
            packet_worker_limit: constants::PACKET_WORKER_LIMIT,
            refresh_node_num: constants::REFRESH_NODE_NUM,
            hooks: Hooks::default(),
        }
    }

    /// Crawl-mode defaults: one unbounded bucket, zero expiries so every
    /// refresh scan churns, fast scan period, wide refresh fan-out.
    pub fn crawl() -> Self {
        Self {
            kbucket_size: usize::MAX,
            node_expired_after: Duration::ZERO,
            kbucket_expired_after: Duration::ZERO,
            check_kbucket_period: Duration::from_secs(5),
            refresh_node_num: 256,
            mode: Mode::Crawl,
            ..Self::standard()
        }
    }

    pub fn is_crawl(&self) -> bool {
        self.mode == Mode::Crawl
    }

    pub fn is_standard(&self) -> bool {
        self.mode == Mode::Standard
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::standard()
    }
}

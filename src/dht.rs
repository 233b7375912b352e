//! Distributed Hash Table ([BEP-5]).
//!
//! The crawler side of the Kademlia-based Mainline DHT. A [`Dht`] joins the
//! overlay from a set of bootstrap routers, keeps a binary-trie routing
//! table of contacts, answers inbound KRPC queries, and drives its own
//! `find_node`/`get_peers` lookups through a retrying transaction manager.
//!
//! Two modes exist (see [`Mode`]):
//!
//! - **Standard** - a well-behaved DHT node: answers `find_node`, stores
//!   announced peers, returns them from `get_peers`.
//! - **Crawl** - a harvester: one giant bucket, no node aging, aggressive
//!   table churn, and `get_peers` answers crafted to attract
//!   `announce_peer` traffic. Observed announces are surfaced through
//!   [`Hooks::on_announce_peer`] so a metadata fetcher can take over.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

mod blacklist;
mod config;
mod error;
mod id;
mod message;
mod node;
mod peers;
mod routing;
mod server;
mod token;
mod transaction;

pub use blacklist::BlackList;
pub use config::{
    AnnouncePeerHook, Config, GetPeersHook, GetPeersResponseHook, Hooks, Mode,
};
pub use error::DhtError;
pub use id::{NodeId, Prefix};
pub use message::{
    KrpcError, KrpcMessage, KrpcPayload, QueryType, GENERIC_ERROR, PROTOCOL_ERROR,
    SERVER_ERROR, UNKNOWN_ERROR,
};
pub use node::{Node, Peer};
pub use peers::PeerIndex;
pub use routing::{KBucket, RoutingTable};
pub use server::Dht;
pub use token::TokenManager;
pub use transaction::{Contact, TransactionManager};

#[cfg(test)]
mod tests;

//! bthound - A BitTorrent Mainline DHT crawler
//!
//! This library joins the Kademlia-based Mainline DHT ([BEP-5]), continually
//! discovers participating nodes, harvests `announce_peer` traffic, and
//! fetches the announced torrents' metadata from peers over TCP using the
//! extension protocol ([BEP-10]) and the ut_metadata extension ([BEP-9]).
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 DHT node: KRPC codec, routing table, transactions
//! - [`wire`] - BEP-9/10 metadata fetcher over the peer wire protocol
//! - [`torrent`] - Info hashes and torrent summaries for consumers
//!
//! # Getting Started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bthound::dht::{Config, Dht};
//! use bthound::wire::{FetchRequest, Wire, WireConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let wire = Wire::new(WireConfig::default());
//! let requests = wire.requests();
//! let mut responses = wire.responses();
//! tokio::spawn(wire.run());
//!
//! let mut config = Config::crawl();
//! config.hooks.on_announce_peer = Some(Arc::new(move |info_hash, ip, port| {
//!     let _ = requests.try_send(FetchRequest::new(info_hash, ip, port));
//! }));
//!
//! let dht = Dht::bind(config).await?;
//! tokio::spawn(async move { dht.run().await });
//!
//! while let Some(resp) = responses.recv().await {
//!     println!("{}: {} bytes of info", resp.info_hash, resp.raw.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

pub mod bencode;
pub mod constants;
pub mod dht;
pub mod torrent;
pub mod wire;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{Config, Dht, DhtError, Mode, Node, NodeId, Peer, RoutingTable};
pub use torrent::{InfoHash, TorrentError, TorrentSummary};
pub use wire::{FetchRequest, MetadataResponse, Wire, WireConfig, WireError};

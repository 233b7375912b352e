//! The metadata fetcher ("wire").
//!
//! Turns `(infohash, ip, port)` triples harvested from `announce_peer`
//! traffic into verified torrent `info` dictionaries. Each request is one
//! short-lived TCP session: BitTorrent handshake with the extension bit
//! set, BEP-10 extension handshake, then the `info` dict downloaded in
//! 16 KiB ut_metadata pieces ([BEP-9]) and checked against the infohash.
//!
//! A fixed pool of workers pulls from a bounded request queue; verified
//! metadata comes out of a bounded response channel. Both sides drop under
//! pressure rather than queue without bound.
//!
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html

mod error;
mod extension;
mod fetcher;
mod message;
mod metadata;

pub use error::WireError;
pub use extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_ID};
pub use fetcher::{FetchRequest, MetadataResponse, Wire, WireConfig};
pub use message::{Frame, Handshake};
pub use metadata::{metadata_piece_count, MetadataMessage, MetadataMessageType};

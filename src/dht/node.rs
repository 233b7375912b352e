use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;

use super::error::DhtError;
use super::id::NodeId;
use crate::constants::{COMPACT_ADDR_LEN, COMPACT_NODE_LEN, ID_LEN};

/// Encodes an endpoint as the 6-byte compact form: IPv4 octets followed by
/// the port in big-endian. IPv6 endpoints are rejected.
pub fn encode_compact_addr(addr: &SocketAddr) -> Result<[u8; COMPACT_ADDR_LEN], DhtError> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut compact = [0u8; COMPACT_ADDR_LEN];
            compact[..4].copy_from_slice(&v4.ip().octets());
            compact[4..].copy_from_slice(&v4.port().to_be_bytes());
            Ok(compact)
        }
        SocketAddr::V6(_) => Err(DhtError::NotIpv4),
    }
}

/// Decodes a 6-byte compact endpoint.
pub fn decode_compact_addr(data: &[u8]) -> Result<SocketAddr, DhtError> {
    if data.len() != COMPACT_ADDR_LEN {
        return Err(DhtError::InvalidCompactInfo);
    }

    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// A contact in the routing table.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_active: Instant,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_active: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Parses the 26-byte compact node info: 20-byte id + endpoint.
    pub fn from_compact(data: &[u8]) -> Result<Self, DhtError> {
        if data.len() != COMPACT_NODE_LEN {
            return Err(DhtError::InvalidCompactInfo);
        }

        let id = NodeId::from_bytes(&data[..ID_LEN])?;
        let addr = decode_compact_addr(&data[ID_LEN..])?;
        Ok(Self::new(id, addr))
    }

    pub fn to_compact(&self) -> Result<[u8; COMPACT_NODE_LEN], DhtError> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..ID_LEN].copy_from_slice(&self.id.0);
        compact[ID_LEN..].copy_from_slice(&encode_compact_addr(&self.addr)?);
        Ok(compact)
    }

    /// The compact endpoint, used as the dedup key in the peer index.
    pub fn compact_addr(&self) -> Result<[u8; COMPACT_ADDR_LEN], DhtError> {
        encode_compact_addr(&self.addr)
    }
}

/// A peer announced for some infohash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
    pub token: Bytes,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16, token: Bytes) -> Self {
        Self { ip, port, token }
    }

    pub fn from_compact(data: &[u8], token: Bytes) -> Result<Self, DhtError> {
        let addr = decode_compact_addr(data)?;
        Ok(Self::new(addr.ip(), addr.port(), token))
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn compact_addr(&self) -> Result<[u8; COMPACT_ADDR_LEN], DhtError> {
        encode_compact_addr(&self.addr())
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("invalid compact info length")]
    InvalidCompactInfo,

    #[error("ipv6 endpoints are not supported")]
    NotIpv4,

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("timeout")]
    Timeout,
}

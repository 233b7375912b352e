use thiserror::Error;

/// Errors of one metadata fetch attempt. All of them end the attempt; the
/// endpoint is blacklisted by the worker.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch deadline exceeded")]
    Timeout,

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("peer answered for a different info hash")]
    InfoHashMismatch,

    #[error("peer does not support the extension protocol")]
    ExtensionUnsupported,

    #[error("peer does not advertise ut_metadata")]
    NoUtMetadata,

    #[error("unusable metadata size: {0}")]
    BadMetadataSize(i64),

    #[error("metadata piece {0} rejected")]
    PieceRejected(u32),

    #[error("unexpected metadata piece {got}, wanted {want}")]
    PieceOutOfOrder { want: u32, got: u32 },

    #[error("metadata length does not match advertised size")]
    SizeMismatch,

    #[error("metadata hash does not match info hash")]
    HashMismatch,

    #[error("frame too large: {0}")]
    FrameTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("extension error: {0}")]
    Extension(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

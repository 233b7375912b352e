use thiserror::Error;

/// Errors that can occur during bencode encoding or decoding.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before a complete value was parsed.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Integer is malformed (leading zeros, empty, or overflow).
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Byte string length prefix is not a valid non-negative number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// Encountered an unexpected character while parsing.
    #[error("unexpected character: {0}")]
    UnexpectedChar(char),

    /// Dictionary key is not a byte string.
    #[error("dict key is not a byte string")]
    InvalidDictKey,

    /// Dictionary keys are duplicated or not in ascending byte order.
    #[error("dict keys unsorted or duplicated")]
    UnsortedDictKeys,

    /// Extra data exists after the top-level value.
    #[error("trailing data after value")]
    TrailingData,

    /// Recursion limit exceeded.
    #[error("nesting too deep")]
    NestingTooDeep,

    /// I/O error during encoding.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

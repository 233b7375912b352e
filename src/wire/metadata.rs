use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::WireError;
use crate::bencode::{decode, encode, Value};
use crate::constants::METADATA_PIECE_SIZE;

/// ut_metadata message types (BEP-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    /// Ask for a piece.
    Request = 0,
    /// Deliver a piece; raw bytes follow the bencoded header.
    Data = 1,
    /// Refuse a request.
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_integer(v: i64) -> Option<Self> {
        match v {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A ut_metadata message: a bencoded header dict, followed for `Data` by
/// up to 16 KiB of raw info bytes.
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    pub total_size: Option<i64>,
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: i64, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Integer(self.msg_type as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Integer(self.piece as i64),
        );
        if let Some(total_size) = self.total_size {
            dict.insert(
                Bytes::from_static(b"total_size"),
                Value::Integer(total_size),
            );
        }

        let header = encode(&Value::Dict(dict))?;

        match self.data {
            Some(ref data) => {
                let mut out = Vec::with_capacity(header.len() + data.len());
                out.extend_from_slice(&header);
                out.extend_from_slice(data);
                Ok(Bytes::from(out))
            }
            None => Ok(Bytes::from(header)),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let header_end = dict_end(payload)?;
        let header = decode(&payload[..header_end])?;

        let msg_type = header
            .get(b"msg_type")
            .and_then(|v| v.as_integer())
            .and_then(MetadataMessageType::from_integer)
            .ok_or_else(|| WireError::Extension("missing msg_type".into()))?;

        let piece = header
            .get(b"piece")
            .and_then(|v| v.as_integer())
            .filter(|p| *p >= 0 && *p <= u32::MAX as i64)
            .ok_or_else(|| WireError::Extension("missing piece".into()))? as u32;

        let total_size = header.get(b"total_size").and_then(|v| v.as_integer());

        let data = if msg_type == MetadataMessageType::Data && header_end < payload.len() {
            Some(Bytes::copy_from_slice(&payload[header_end..]))
        } else {
            None
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// The offset just past the bencoded dict at the start of `payload`. Data
/// messages carry raw bytes after the dict, so the decoder cannot assume
/// the whole payload bdecodes.
fn dict_end(payload: &[u8]) -> Result<usize, WireError> {
    if payload.first() != Some(&b'd') {
        return Err(WireError::Extension("payload must start with a dict".into()));
    }

    let mut depth = 0usize;
    let mut i = 0;

    while i < payload.len() {
        match payload[i] {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
            }
            b'e' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| WireError::Extension("unbalanced dict".into()))?;
                i += 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            b'i' => {
                i += 1;
                while i < payload.len() && payload[i] != b'e' {
                    i += 1;
                }
                i += 1;
            }
            b'0'..=b'9' => {
                let len_start = i;
                while i < payload.len() && payload[i] != b':' {
                    i += 1;
                }
                let len: usize = std::str::from_utf8(&payload[len_start..i])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| WireError::Extension("bad string length".into()))?;
                i += 1 + len;
            }
            _ => return Err(WireError::Extension("invalid bencode".into())),
        }
    }

    Err(WireError::Extension("unterminated dict".into()))
}

/// Number of 16 KiB pieces covering `metadata_size` bytes.
pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

//! Info hashes and torrent summaries.
//!
//! The crawler identifies a torrent by the SHA-1 of its bencoded `info`
//! dictionary. [`TorrentSummary`] is the small consumer-facing view pulled
//! out of a fetched `info` dict: the name plus either a single length or a
//! file list.

use std::fmt;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::Value;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("invalid info hash length")]
    InvalidLength,

    #[error("info dict has no name")]
    MissingName,

    #[error("malformed file entry")]
    MalformedFile,
}

/// A 20-byte torrent identifier: SHA-1 of the bencoded `info` dict.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TorrentError> {
        if bytes.len() != 20 {
            return Err(TorrentError::InvalidLength);
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Ok(Self(hash))
    }

    /// Hashes raw `info` dict bytes.
    pub fn from_info_bytes(info: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One file of a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components, top directory first.
    pub path: Vec<Bytes>,
    pub length: i64,
}

/// The consumer-facing view of a fetched torrent.
#[derive(Debug, Clone)]
pub struct TorrentSummary {
    pub info_hash: InfoHash,
    pub name: Bytes,
    /// Total length for single-file torrents.
    pub length: Option<i64>,
    /// File list for multi-file torrents.
    pub files: Vec<TorrentFile>,
}

impl TorrentSummary {
    /// Extracts the summary from a decoded `info` dict. Torrents without a
    /// `name` are rejected.
    pub fn from_info(info_hash: InfoHash, info: &Value) -> Result<Self, TorrentError> {
        let name = info
            .get(b"name")
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or(TorrentError::MissingName)?;

        let mut summary = Self {
            info_hash,
            name,
            length: None,
            files: Vec::new(),
        };

        if let Some(files) = info.get(b"files").and_then(|v| v.as_list()) {
            for entry in files {
                let path = entry
                    .get(b"path")
                    .and_then(|v| v.as_list())
                    .ok_or(TorrentError::MalformedFile)?;
                let length = entry
                    .get(b"length")
                    .and_then(|v| v.as_integer())
                    .ok_or(TorrentError::MalformedFile)?;

                let path = path
                    .iter()
                    .map(|p| p.as_bytes().cloned().ok_or(TorrentError::MalformedFile))
                    .collect::<Result<Vec<_>, _>>()?;

                summary.files.push(TorrentFile { path, length });
            }
        } else if let Some(length) = info.get(b"length").and_then(|v| v.as_integer()) {
            summary.length = Some(length);
        }

        Ok(summary)
    }
}

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::WireError;
use crate::bencode::{decode, encode, Value};

/// Extension sub-id carrying the handshake itself (BEP-10).
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The sub-id this client registers for ut_metadata messages.
pub const UT_METADATA_ID: u8 = 1;

/// The BEP-10 extension handshake dict: `{m: {<name>: <sub-id>, ...},
/// metadata_size: ..., v: ...}`.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub metadata_size: Option<i64>,
    pub client: Option<String>,
}

impl ExtensionHandshake {
    /// The handshake this crawler sends: ut_metadata only.
    pub fn ours() -> Self {
        let mut hs = Self::default();
        hs.extensions
            .insert("ut_metadata".to_string(), UT_METADATA_ID);
        hs
    }

    /// The peer's sub-id for ut_metadata, if advertised.
    pub fn ut_metadata(&self) -> Option<u8> {
        self.extensions.get("ut_metadata").copied()
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(*id as i64),
            );
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size));
        }

        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }

        Ok(Bytes::from(encode(&Value::Dict(dict))?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| WireError::Extension("handshake is not a dict".into()))?;

        let mut hs = Self::default();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (key, val) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) {
                    // Sub-id 0 means the peer disabled the extension.
                    if id > 0 && id <= u8::MAX as i64 {
                        hs.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        hs.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_integer());

        hs.client = dict
            .get(b"v".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(hs)
    }
}

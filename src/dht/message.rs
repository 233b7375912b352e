use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::DhtError;
use crate::bencode::{decode, encode, Value};

/// KRPC error codes (BEP-5).
pub const GENERIC_ERROR: i64 = 201;
pub const SERVER_ERROR: i64 = 202;
pub const PROTOCOL_ERROR: i64 = 203;
pub const UNKNOWN_ERROR: i64 = 204;

/// The four KRPC query types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Ping => "ping",
            QueryType::FindNode => "find_node",
            QueryType::GetPeers => "get_peers",
            QueryType::AnnouncePeer => "announce_peer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ping" => Some(QueryType::Ping),
            "find_node" => Some(QueryType::FindNode),
            "get_peers" => Some(QueryType::GetPeers),
            "announce_peer" => Some(QueryType::AnnouncePeer),
            _ => None,
        }
    }
}

/// An error payload: `e = [code, message]`.
#[derive(Debug, Clone)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: PROTOCOL_ERROR,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            code: GENERIC_ERROR,
            message: message.into(),
        }
    }
}

/// A parsed inbound KRPC datagram.
///
/// Parsing stops at the envelope: query payloads keep the whole top-level
/// dict so the dispatcher can validate `q`/`a` field-by-field and still
/// answer protocol errors with the transaction id.
#[derive(Debug, Clone)]
pub struct KrpcMessage {
    pub transaction_id: Bytes,
    pub payload: KrpcPayload,
}

#[derive(Debug, Clone)]
pub enum KrpcPayload {
    /// `y = "q"`. The full message dict, `q` and `a` not yet validated.
    Query(BTreeMap<Bytes, Value>),
    /// `y = "r"`. The response dict under `r`.
    Response(BTreeMap<Bytes, Value>),
    /// `y = "e"`.
    Error { code: i64, message: String },
}

impl KrpcMessage {
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let mut dict = value
            .into_dict()
            .ok_or_else(|| DhtError::InvalidMessage("not a dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        let payload = match kind.as_str() {
            "q" => KrpcPayload::Query(dict),
            "r" => {
                let body = dict
                    .remove(b"r".as_slice())
                    .and_then(|v| v.into_dict())
                    .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;
                KrpcPayload::Response(body)
            }
            "e" => {
                let error = dict
                    .remove(b"e".as_slice())
                    .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;
                let error = error
                    .as_list()
                    .ok_or_else(|| DhtError::InvalidMessage("error is not a list".into()))?;

                if error.len() != 2 {
                    return Err(DhtError::InvalidMessage("error list length".into()));
                }

                let code = error[0].as_integer().unwrap_or(0);
                let message = error[1].as_str().unwrap_or("unknown error").to_string();
                KrpcPayload::Error { code, message }
            }
            other => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {}",
                    other
                )))
            }
        };

        Ok(Self {
            transaction_id,
            payload,
        })
    }
}

/// Encodes an outbound query: `{t, y: "q", q, a}`.
pub fn make_query(
    tid: &[u8],
    query_type: QueryType,
    args: BTreeMap<Bytes, Value>,
) -> Result<Vec<u8>, DhtError> {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"t"), Value::bytes(tid));
    dict.insert(Bytes::from_static(b"y"), Value::string("q"));
    dict.insert(Bytes::from_static(b"q"), Value::string(query_type.as_str()));
    dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
    Ok(encode(&Value::Dict(dict))?)
}

/// Encodes an outbound response: `{t, y: "r", r}`.
pub fn make_response(tid: &[u8], body: BTreeMap<Bytes, Value>) -> Result<Vec<u8>, DhtError> {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"t"), Value::bytes(tid));
    dict.insert(Bytes::from_static(b"y"), Value::string("r"));
    dict.insert(Bytes::from_static(b"r"), Value::Dict(body));
    Ok(encode(&Value::Dict(dict))?)
}

/// Encodes an outbound error: `{t, y: "e", e: [code, message]}`.
pub fn make_error(tid: &[u8], error: &KrpcError) -> Result<Vec<u8>, DhtError> {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"t"), Value::bytes(tid));
    dict.insert(Bytes::from_static(b"y"), Value::string("e"));
    dict.insert(
        Bytes::from_static(b"e"),
        Value::List(vec![
            Value::Integer(error.code),
            Value::string(&error.message),
        ]),
    );
    Ok(encode(&Value::Dict(dict))?)
}

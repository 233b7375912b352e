use std::net::IpAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

use super::error::WireError;
use super::extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_ID};
use super::message::{Handshake, Transport};
use super::metadata::{metadata_piece_count, MetadataMessage, MetadataMessageType};
use crate::bencode::{decode, Value};
use crate::constants::{
    FETCH_TIMEOUT, MAX_METADATA_SIZE, METADATA_PIECE_SIZE, WIRE_BLACKLIST_SIZE,
    WIRE_REQUEST_QUEUE, WIRE_RESPONSE_BUF, WIRE_WORKER_LIMIT,
};
use crate::dht::BlackList;
use crate::torrent::InfoHash;

/// Metadata fetcher tuning.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Worker count; each worker runs one TCP session at a time.
    pub worker_limit: usize,
    /// Request queue depth; new requests are dropped when full.
    pub request_queue: usize,
    /// Response channel capacity; responses are dropped when the consumer
    /// lags.
    pub response_buf: usize,
    /// Bound on the failed-endpoint blacklist.
    pub blacklist_size: usize,
    /// Largest advertised metadata_size accepted.
    pub max_metadata_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            worker_limit: WIRE_WORKER_LIMIT,
            request_queue: WIRE_REQUEST_QUEUE,
            response_buf: WIRE_RESPONSE_BUF,
            blacklist_size: WIRE_BLACKLIST_SIZE,
            max_metadata_size: MAX_METADATA_SIZE,
        }
    }
}

/// One metadata fetch job, usually minted by the DHT's announce hook.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub info_hash: InfoHash,
    pub ip: IpAddr,
    pub port: u16,
}

impl FetchRequest {
    pub fn new(info_hash: InfoHash, ip: IpAddr, port: u16) -> Self {
        Self {
            info_hash,
            ip,
            port,
        }
    }
}

/// A verified `info` dictionary.
#[derive(Debug, Clone)]
pub struct MetadataResponse {
    pub info_hash: InfoHash,
    /// The decoded info dict.
    pub info: Value,
    /// The raw info bytes whose SHA-1 equals `info_hash`.
    pub raw: Bytes,
}

/// The metadata fetcher: a bounded queue feeding a fixed pool of TCP
/// workers.
///
/// Take [`responses`](Wire::responses) before spawning [`run`](Wire::run);
/// submit jobs through the sender from [`requests`](Wire::requests).
/// `run` exits once every request sender is dropped and the queue drains.
pub struct Wire {
    config: WireConfig,
    request_tx: mpsc::Sender<FetchRequest>,
    request_rx: Mutex<Option<mpsc::Receiver<FetchRequest>>>,
    response_tx: mpsc::Sender<MetadataResponse>,
    response_rx: Mutex<Option<mpsc::Receiver<MetadataResponse>>>,
    blacklist: Arc<BlackList>,
}

impl Wire {
    pub fn new(config: WireConfig) -> Self {
        let (request_tx, request_rx) = mpsc::channel(config.request_queue);
        let (response_tx, response_rx) = mpsc::channel(config.response_buf);
        let blacklist = Arc::new(BlackList::new(config.blacklist_size));

        Self {
            config,
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            response_tx,
            response_rx: Mutex::new(Some(response_rx)),
            blacklist,
        }
    }

    /// A handle for submitting fetch requests. `try_send` on it is the
    /// intended drop-on-overflow entry point.
    pub fn requests(&self) -> mpsc::Sender<FetchRequest> {
        self.request_tx.clone()
    }

    /// The verified-metadata channel. May be taken once.
    pub fn responses(&self) -> mpsc::Receiver<MetadataResponse> {
        self.response_rx
            .lock()
            .take()
            .expect("responses channel already taken")
    }

    /// Runs the worker pool to completion.
    pub async fn run(self) {
        let Wire {
            config,
            request_tx,
            request_rx,
            response_tx,
            response_rx: _,
            blacklist,
        } = self;

        // Only external senders keep the queue open.
        drop(request_tx);

        let request_rx = request_rx
            .lock()
            .take()
            .expect("wire worker pool started twice");
        let request_rx = Arc::new(tokio::sync::Mutex::new(request_rx));

        let mut workers = JoinSet::new();
        for _ in 0..config.worker_limit.max(1) {
            let request_rx = request_rx.clone();
            let response_tx = response_tx.clone();
            let blacklist = blacklist.clone();
            let max_metadata_size = config.max_metadata_size;

            workers.spawn(async move {
                loop {
                    let request = { request_rx.lock().await.recv().await };
                    let Some(request) = request else {
                        break;
                    };

                    if blacklist.contains(request.ip, request.port) {
                        continue;
                    }

                    let fetch = fetch_metadata(&request, max_metadata_size);
                    match timeout(FETCH_TIMEOUT, fetch).await {
                        Ok(Ok(response)) => {
                            if response_tx.try_send(response).is_err() {
                                debug!(
                                    "consumer lagging, dropping metadata for {}",
                                    request.info_hash
                                );
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(
                                "fetch {} from {}:{} failed: {}",
                                request.info_hash, request.ip, request.port, e
                            );
                            blacklist.insert(request.ip, Some(request.port));
                        }
                        Err(_) => {
                            debug!(
                                "fetch {} from {}:{} timed out",
                                request.info_hash, request.ip, request.port
                            );
                            blacklist.insert(request.ip, Some(request.port));
                        }
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }
}

/// One complete BEP-9 exchange over a fresh TCP connection.
async fn fetch_metadata(
    request: &FetchRequest,
    max_metadata_size: usize,
) -> Result<MetadataResponse, WireError> {
    let stream = TcpStream::connect((request.ip, request.port)).await?;
    let mut transport = Transport::new(stream);

    let mut peer_id = [0u8; 20];
    rand::rng().fill(&mut peer_id);

    transport
        .send_handshake(&Handshake::new(request.info_hash.0, peer_id))
        .await?;
    let theirs = transport.receive_handshake().await?;

    if theirs.info_hash != request.info_hash.0 {
        return Err(WireError::InfoHashMismatch);
    }
    if !theirs.supports_extension_protocol() {
        return Err(WireError::ExtensionUnsupported);
    }

    let ours = ExtensionHandshake::ours().encode()?;
    transport.send_extended(EXTENSION_HANDSHAKE_ID, &ours).await?;

    let peer_handshake = loop {
        let (ext_id, payload) = transport.next_extended().await?;
        if ext_id == EXTENSION_HANDSHAKE_ID {
            break ExtensionHandshake::decode(&payload)?;
        }
    };

    let ut_metadata = peer_handshake
        .ut_metadata()
        .ok_or(WireError::NoUtMetadata)?;

    let size = peer_handshake.metadata_size.unwrap_or(0);
    if size <= 0 || size as usize > max_metadata_size {
        return Err(WireError::BadMetadataSize(size));
    }
    let size = size as usize;

    let mut info = BytesMut::with_capacity(size);
    for piece in 0..metadata_piece_count(size) as u32 {
        transport
            .send_extended(ut_metadata, &MetadataMessage::request(piece).encode()?)
            .await?;

        let msg = loop {
            let (ext_id, payload) = transport.next_extended().await?;
            if ext_id == UT_METADATA_ID {
                break MetadataMessage::decode(&payload)?;
            }
        };

        match msg.msg_type {
            MetadataMessageType::Data => {
                if msg.piece != piece {
                    return Err(WireError::PieceOutOfOrder {
                        want: piece,
                        got: msg.piece,
                    });
                }
                let data = msg
                    .data
                    .ok_or_else(|| WireError::Extension("data message without payload".into()))?;
                if data.len() > METADATA_PIECE_SIZE {
                    return Err(WireError::Extension("oversized piece".into()));
                }
                info.extend_from_slice(&data);
            }
            MetadataMessageType::Reject => return Err(WireError::PieceRejected(piece)),
            MetadataMessageType::Request => {
                return Err(WireError::Extension("unexpected request from peer".into()))
            }
        }
    }

    if info.len() != size {
        return Err(WireError::SizeMismatch);
    }

    let raw = info.freeze();
    if InfoHash::from_info_bytes(&raw) != request.info_hash {
        return Err(WireError::HashMismatch);
    }

    let info = decode(&raw)?;

    Ok(MetadataResponse {
        info_hash: request.info_hash,
        info,
        raw,
    })
}

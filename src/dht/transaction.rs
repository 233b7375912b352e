use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::blacklist::BlackList;
use super::id::NodeId;
use super::message::{make_query, QueryType};
use super::node::Node;
use super::routing::RoutingTable;
use crate::bencode::Value;
use crate::constants::QUERY_TIMEOUT;
use crate::torrent::InfoHash;

/// A query target. Bootstrap routers are contacted before their id is
/// known, so the id is optional.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: Option<NodeId>, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl From<&Node> for Contact {
    fn from(node: &Node) -> Self {
        Self {
            id: Some(node.id),
            addr: node.addr,
        }
    }
}

/// An in-flight outbound query.
pub struct Transaction {
    pub id: Bytes,
    pub query_type: QueryType,
    pub contact: Contact,
    /// The `a` arguments as sent; response handling reads `target` /
    /// `info_hash` back out of here.
    pub args: BTreeMap<Bytes, Value>,
    response: mpsc::Sender<()>,
}

impl Transaction {
    /// Resolves the transaction. Extra signals beyond the channel capacity
    /// are dropped, which is fine: one is enough.
    pub fn signal(&self) {
        let _ = self.response.try_send(());
    }

    pub fn arg_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.args.get(key).and_then(|v| v.as_bytes())
    }
}

struct OutboundQuery {
    contact: Contact,
    query_type: QueryType,
    args: BTreeMap<Bytes, Value>,
}

/// Manages outbound KRPC queries: transaction ids, retries, timeouts, and
/// dedup so at most one query of a given type is in flight per remote.
pub struct TransactionManager {
    local_id: NodeId,
    crawl: bool,
    try_times: usize,
    max_cursor: u64,
    cursor: Mutex<u64>,
    transactions: DashMap<Bytes, Arc<Transaction>>,
    index: DashMap<String, Arc<Transaction>>,
    /// Guards the paired insert/remove into both maps.
    index_lock: Mutex<()>,
    query_tx: mpsc::Sender<OutboundQuery>,
    query_rx: Mutex<Option<mpsc::Receiver<OutboundQuery>>>,
    socket: Arc<UdpSocket>,
    routing: Arc<RoutingTable>,
    blacklist: Arc<BlackList>,
}

impl TransactionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        crawl: bool,
        try_times: usize,
        max_cursor: u64,
        queue_depth: usize,
        socket: Arc<UdpSocket>,
        routing: Arc<RoutingTable>,
        blacklist: Arc<BlackList>,
    ) -> Self {
        let (query_tx, query_rx) = mpsc::channel(queue_depth);
        Self {
            local_id,
            crawl,
            try_times,
            max_cursor,
            cursor: Mutex::new(0),
            transactions: DashMap::new(),
            index: DashMap::new(),
            index_lock: Mutex::new(()),
            query_tx,
            query_rx: Mutex::new(Some(query_rx)),
            socket,
            routing,
            blacklist,
        }
    }

    /// The id sent in our own query arguments: in crawl mode one derived
    /// from the target so we get stored near it, otherwise the local id.
    fn id_for(&self, target: Option<&NodeId>) -> NodeId {
        match (self.crawl, target) {
            (true, Some(target)) => self.local_id.derived(target),
            _ => self.local_id,
        }
    }

    /// The next transaction id: the cursor modulo `max_cursor`, encoded
    /// big-endian at its minimum width.
    pub(crate) fn gen_trans_id(&self) -> Bytes {
        let mut cursor = self.cursor.lock();
        *cursor = (*cursor + 1) % self.max_cursor;
        Bytes::from(int_to_bytes(*cursor))
    }

    fn index_key(query_type: QueryType, addr: &SocketAddr) -> String {
        format!("{}:{}", query_type.as_str(), addr)
    }

    /// Enqueues a query unless the target is ourselves, an equivalent
    /// query is already in flight, or the remote is blacklisted.
    fn send_query(&self, contact: &Contact, query_type: QueryType, args: BTreeMap<Bytes, Value>) {
        if contact.id == Some(self.local_id)
            || self.index.contains_key(&Self::index_key(query_type, &contact.addr))
            || self.blacklist.contains(contact.addr.ip(), contact.addr.port())
        {
            return;
        }

        let query = OutboundQuery {
            contact: contact.clone(),
            query_type,
            args,
        };

        if self.query_tx.try_send(query).is_err() {
            warn!("query channel full, dropping {} query", query_type.as_str());
        }
    }

    pub fn ping(&self, contact: &Contact) {
        let mut args = BTreeMap::new();
        args.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id_for(contact.id.as_ref()).as_bytes()),
        );
        self.send_query(contact, QueryType::Ping, args);
    }

    pub fn find_node(&self, contact: &Contact, target: &NodeId) {
        let mut args = BTreeMap::new();
        args.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id_for(Some(target)).as_bytes()),
        );
        args.insert(Bytes::from_static(b"target"), Value::bytes(target.as_bytes()));
        self.send_query(contact, QueryType::FindNode, args);
    }

    pub fn get_peers(&self, contact: &Contact, info_hash: &InfoHash) {
        let target = NodeId(*info_hash.as_bytes());
        let mut args = BTreeMap::new();
        args.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id_for(Some(&target)).as_bytes()),
        );
        args.insert(
            Bytes::from_static(b"info_hash"),
            Value::bytes(info_hash.as_bytes()),
        );
        self.send_query(contact, QueryType::GetPeers, args);
    }

    pub fn announce_peer(
        &self,
        contact: &Contact,
        info_hash: &InfoHash,
        port: u16,
        implied_port: bool,
        token: Bytes,
    ) {
        let mut args = BTreeMap::new();
        args.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id_for(contact.id.as_ref()).as_bytes()),
        );
        args.insert(
            Bytes::from_static(b"info_hash"),
            Value::bytes(info_hash.as_bytes()),
        );
        args.insert(
            Bytes::from_static(b"implied_port"),
            Value::Integer(implied_port as i64),
        );
        args.insert(Bytes::from_static(b"port"), Value::Integer(port as i64));
        args.insert(Bytes::from_static(b"token"), Value::Bytes(token));
        self.send_query(contact, QueryType::AnnouncePeer, args);
    }

    /// Resolves an inbound response to its transaction only if the
    /// transaction exists and the remote address matches. Mismatches are
    /// dropped, not errors.
    pub fn filter_one(&self, tid: &[u8], addr: &SocketAddr) -> Option<Arc<Transaction>> {
        let trans = self.transactions.get(tid).map(|e| e.value().clone())?;
        if trans.contact.addr != *addr {
            return None;
        }
        Some(trans)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn insert(&self, trans: Arc<Transaction>) {
        let _guard = self.index_lock.lock();
        self.transactions.insert(trans.id.clone(), trans.clone());
        self.index
            .insert(Self::index_key(trans.query_type, &trans.contact.addr), trans);
    }

    fn delete(&self, trans: &Transaction) {
        let _guard = self.index_lock.lock();
        self.transactions.remove(&trans.id);
        self.index
            .remove(&Self::index_key(trans.query_type, &trans.contact.addr));
    }

    /// Consumes the query channel, spawning one driver per query.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self
            .query_rx
            .lock()
            .take()
            .expect("transaction consumer started twice");

        while let Some(query) = rx.recv().await {
            let manager = self.clone();
            tokio::spawn(async move { manager.query(query).await });
        }
    }

    /// Drives one query to completion: up to `try_times` sends, each
    /// waiting [`QUERY_TIMEOUT`] for the response signal. Exhaustion of a
    /// node with a known id blacklists and evicts it.
    async fn query(&self, query: OutboundQuery) {
        let tid = self.gen_trans_id();
        let (response_tx, mut response_rx) = mpsc::channel(self.try_times + 1);

        let trans = Arc::new(Transaction {
            id: tid.clone(),
            query_type: query.query_type,
            contact: query.contact.clone(),
            args: query.args.clone(),
            response: response_tx,
        });

        debug!(
            "query {} -> {}",
            query.query_type.as_str(),
            query.contact.addr
        );

        self.insert(trans.clone());

        let mut success = false;
        for _ in 0..self.try_times {
            let data = match make_query(&tid, query.query_type, query.args.clone()) {
                Ok(data) => data,
                Err(_) => break,
            };

            if send_packet(&self.socket, &self.blacklist, &query.contact.addr, &data)
                .await
                .is_err()
            {
                break;
            }

            tokio::select! {
                _ = response_rx.recv() => {
                    success = true;
                    break;
                }
                _ = sleep(QUERY_TIMEOUT) => {}
            }
        }

        if !success && query.contact.id.is_some() {
            self.blacklist
                .insert(query.contact.addr.ip(), Some(query.contact.addr.port()));
            self.routing.remove_by_addr(&query.contact.addr);
        }

        self.delete(&trans);
    }
}

/// Minimal big-endian encoding of an unsigned integer, at least one byte.
pub(crate) fn int_to_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

/// Writes one datagram with the standard write deadline. A failed or timed
/// out write blacklists the endpoint.
pub(crate) async fn send_packet(
    socket: &UdpSocket,
    blacklist: &BlackList,
    addr: &SocketAddr,
    data: &[u8],
) -> Result<(), super::error::DhtError> {
    let result = timeout(QUERY_TIMEOUT, socket.send_to(data, *addr)).await;

    match result {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            blacklist.insert(addr.ip(), Some(addr.port()));
            Err(e.into())
        }
        Err(_) => {
            blacklist.insert(addr.ip(), Some(addr.port()));
            Err(super::error::DhtError::Timeout)
        }
    }
}

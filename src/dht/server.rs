use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::blacklist::BlackList;
use super::config::{Config, Mode};
use super::error::DhtError;
use super::id::NodeId;
use super::message::{
    make_error, make_response, KrpcError, KrpcMessage, KrpcPayload, QueryType,
};
use super::node::{Node, Peer};
use super::peers::PeerIndex;
use super::routing::RoutingTable;
use super::token::TokenManager;
use super::transaction::{send_packet, Contact, TransactionManager};
use crate::bencode::Value;
use crate::constants::{COMPACT_NODE_LEN, TOKEN_CLEAR_PERIOD};
use crate::torrent::InfoHash;

/// The DHT node.
///
/// Binds a UDP socket, joins the overlay from the configured bootstrap
/// routers, and runs the crawl loop: inbound datagrams are handled by a
/// bounded worker pool, outbound lookups by the transaction manager, and a
/// periodic tick refreshes (or, in crawl mode, churns) the routing table.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    local_id: NodeId,
    socket: Arc<UdpSocket>,
    routing: Arc<RoutingTable>,
    blacklist: Arc<BlackList>,
    tokens: Arc<TokenManager>,
    peers: Arc<PeerIndex>,
    transactions: Arc<TransactionManager>,
    packet_workers: Arc<Semaphore>,
}

impl Dht {
    /// Binds the configured UDP address and assembles the node. `run` must
    /// be called for anything to happen.
    pub async fn bind(config: Config) -> Result<Self, DhtError> {
        if config.network != "udp4" {
            return Err(DhtError::UnsupportedNetwork(config.network.clone()));
        }

        let socket = Arc::new(UdpSocket::bind(&config.address).await?);
        let local_id = NodeId::generate();

        info!(
            "dht bound to {} with id {}",
            socket.local_addr()?,
            local_id
        );

        let blacklist = Arc::new(BlackList::new(config.blacklist_max_size));
        for ip in &config.blocked_ips {
            blacklist.insert(*ip, None);
        }

        let routing = Arc::new(RoutingTable::new(
            config.kbucket_size,
            config.max_nodes,
            config.node_expired_after,
            config.kbucket_expired_after,
            blacklist.clone(),
        ));

        let transactions = Arc::new(TransactionManager::new(
            local_id,
            config.is_crawl(),
            config.try_times,
            config.max_transaction_cursor,
            config.packet_job_limit,
            socket.clone(),
            routing.clone(),
            blacklist.clone(),
        ));

        let tokens = Arc::new(TokenManager::new(config.token_expired_after));
        let peers = Arc::new(PeerIndex::new(config.k));
        let packet_workers = Arc::new(Semaphore::new(config.packet_worker_limit));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                local_id,
                socket,
                routing,
                blacklist,
                tokens,
                peers,
                transactions,
                packet_workers,
            }),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing
    }

    /// Starts an ad-hoc `get_peers` lookup for an infohash.
    pub fn get_peers(&self, info_hash: &InfoHash) {
        let target = NodeId(*info_hash.as_bytes());
        for node in self.inner.routing.get_neighbors(&target, self.inner.config.k) {
            self.inner.transactions.get_peers(&Contact::from(&node), info_hash);
        }
    }

    /// Runs the node until the task is dropped.
    pub async fn run(&self) -> Result<(), DhtError> {
        let inner = &self.inner;

        tokio::spawn(inner.transactions.clone().run());

        inner.join().await;

        let mut buf = vec![0u8; 65535];
        let mut refresh = tokio::time::interval(inner.config.check_kbucket_period);
        let mut token_sweep = tokio::time::interval(TOKEN_CLEAR_PERIOD);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        token_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        refresh.tick().await;
        token_sweep.tick().await;

        loop {
            tokio::select! {
                result = inner.socket.recv_from(&mut buf) => {
                    let (n, addr) = result?;
                    // Saturated pool: the packet is dropped, never queued.
                    match inner.packet_workers.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                inner.handle_packet(&data, addr).await;
                                drop(permit);
                            });
                        }
                        Err(_) => debug!("packet workers saturated, dropping datagram from {}", addr),
                    }
                }
                _ = refresh.tick() => {
                    if inner.routing.is_empty() {
                        inner.join().await;
                    } else {
                        inner.refresh();
                    }
                }
                _ = token_sweep.tick() => {
                    inner.tokens.clear_expired();
                }
            }
        }
    }
}

impl Inner {
    /// Bootstraps by asking every prime node for our own neighborhood.
    async fn join(&self) {
        for host in &self.config.prime_nodes {
            match lookup_host(host).await {
                Ok(addrs) => {
                    for addr in addrs.filter(|a| a.is_ipv4()) {
                        self.transactions
                            .find_node(&Contact::new(None, addr), &self.local_id);
                    }
                }
                Err(e) => warn!("failed to resolve prime node {}: {}", host, e),
            }
        }
    }

    /// One refresh pass: find_node into every stale bucket and liveness
    /// pings for nodes flagged by candidate overflow.
    fn refresh(&self) {
        let plan = self
            .routing
            .refresh_plan(self.config.refresh_node_num, self.config.is_crawl());
        if !plan.is_empty() {
            debug!("refreshing {} nodes", plan.len());
        }
        for (node, target) in plan {
            self.transactions.find_node(&Contact::from(&node), &target);
        }

        for node in self.routing.take_stale_pings() {
            self.transactions.ping(&Contact::from(&node));
        }
    }

    async fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        if self.blacklist.contains(addr.ip(), addr.port()) {
            return;
        }

        let msg = match KrpcMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("bad datagram from {}: {}", addr, e);
                return;
            }
        };

        match msg.payload {
            KrpcPayload::Query(dict) => {
                self.handle_request(&msg.transaction_id, &dict, addr).await
            }
            KrpcPayload::Response(body) => {
                self.handle_response(&msg.transaction_id, &body, addr).await
            }
            KrpcPayload::Error { code, message } => {
                self.handle_error(&msg.transaction_id, code, &message, addr)
            }
        }
    }

    async fn reply(&self, addr: &SocketAddr, data: Result<Vec<u8>, DhtError>) {
        if let Ok(data) = data {
            let _ = send_packet(&self.socket, &self.blacklist, addr, &data).await;
        }
    }

    async fn reply_error(&self, tid: &[u8], addr: &SocketAddr, error: KrpcError) {
        self.reply(addr, make_error(tid, &error)).await;
    }

    /// The id placed in reply payloads; in crawl mode derived from the
    /// requested key so requesters store us near it.
    fn id_for(&self, target: Option<&NodeId>) -> NodeId {
        match (self.config.mode, target) {
            (Mode::Crawl, Some(target)) => self.local_id.derived(target),
            _ => self.local_id,
        }
    }

    async fn handle_request(
        &self,
        tid: &Bytes,
        dict: &BTreeMap<Bytes, Value>,
        addr: SocketAddr,
    ) {
        let query_name = dict.get(b"q".as_slice()).and_then(|v| v.as_str());
        let args = dict.get(b"a".as_slice()).and_then(|v| v.as_dict());

        let (Some(query_name), Some(args)) = (query_name, args) else {
            self.reply_error(tid, &addr, KrpcError::protocol("missing q or a"))
                .await;
            return;
        };

        let Some(id_bytes) = args.get(b"id".as_slice()).and_then(|v| v.as_bytes()) else {
            self.reply_error(tid, &addr, KrpcError::protocol("lack of id"))
                .await;
            return;
        };

        let Ok(sender_id) = NodeId::from_bytes(id_bytes) else {
            self.reply_error(tid, &addr, KrpcError::protocol("invalid id"))
                .await;
            return;
        };

        if sender_id == self.local_id {
            return;
        }

        // The address is bound to a different id: evict the liar.
        if let Some(known) = self.routing.get_node_by_addr(&addr) {
            if known.id != sender_id {
                self.blacklist.insert(addr.ip(), Some(addr.port()));
                self.routing.remove_by_addr(&addr);
                self.reply_error(tid, &addr, KrpcError::protocol("invalid id"))
                    .await;
                return;
            }
        }

        match QueryType::parse(query_name) {
            Some(QueryType::Ping) => {
                let mut body = BTreeMap::new();
                body.insert(
                    Bytes::from_static(b"id"),
                    Value::bytes(self.id_for(Some(&sender_id)).as_bytes()),
                );
                self.reply(&addr, make_response(tid, body)).await;
            }
            Some(QueryType::FindNode) => {
                if !self.handle_find_node(tid, args, &addr).await {
                    return;
                }
            }
            Some(QueryType::GetPeers) => {
                if !self.handle_get_peers(tid, args, &addr).await {
                    return;
                }
            }
            Some(QueryType::AnnouncePeer) => {
                if !self.handle_announce_peer(tid, args, &sender_id, &addr).await {
                    return;
                }
            }
            None => return,
        }

        self.routing.insert(Node::new(sender_id, addr));
    }

    /// Standard mode answers with the target itself when known, otherwise
    /// the K closest nodes. Crawl mode stays silent: the node still gets
    /// learned, but gossip is someone else's job.
    async fn handle_find_node(
        &self,
        tid: &Bytes,
        args: &BTreeMap<Bytes, Value>,
        addr: &SocketAddr,
    ) -> bool {
        if !self.config.is_standard() {
            return true;
        }

        let Some(target_bytes) = args.get(b"target".as_slice()).and_then(|v| v.as_bytes())
        else {
            self.reply_error(tid, addr, KrpcError::protocol("lack of target"))
                .await;
            return false;
        };

        let Ok(target) = NodeId::from_bytes(target_bytes) else {
            self.reply_error(tid, addr, KrpcError::protocol("invalid target"))
                .await;
            return false;
        };

        let nodes = match self.routing.get_node_by_id(&target) {
            Some(node) => node.to_compact().map(|c| c.to_vec()).unwrap_or_default(),
            None => self
                .routing
                .get_neighbor_compact_infos(&target, self.config.k),
        };

        let mut body = BTreeMap::new();
        body.insert(
            Bytes::from_static(b"id"),
            Value::bytes(self.id_for(Some(&target)).as_bytes()),
        );
        body.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(nodes)));
        self.reply(addr, make_response(tid, body)).await;
        true
    }

    /// Crawl mode hands out a token with empty `nodes`: the goal is the
    /// follow-up `announce_peer`, not gossip. Standard mode follows BEP-5:
    /// known peers as `values`, otherwise the K closest as `nodes`.
    async fn handle_get_peers(
        &self,
        tid: &Bytes,
        args: &BTreeMap<Bytes, Value>,
        addr: &SocketAddr,
    ) -> bool {
        let Some(hash_bytes) = args.get(b"info_hash".as_slice()).and_then(|v| v.as_bytes())
        else {
            self.reply_error(tid, addr, KrpcError::protocol("lack of info_hash"))
                .await;
            return false;
        };

        let Ok(info_hash) = InfoHash::from_bytes(hash_bytes) else {
            self.reply_error(tid, addr, KrpcError::protocol("invalid info_hash"))
                .await;
            return false;
        };

        let target = NodeId(*info_hash.as_bytes());
        let reply_id = Value::bytes(self.id_for(Some(&target)).as_bytes());
        let token = Value::Bytes(self.tokens.token(addr.ip()));

        let mut body = BTreeMap::new();
        body.insert(Bytes::from_static(b"id"), reply_id);
        body.insert(Bytes::from_static(b"token"), token);

        if self.config.is_crawl() {
            body.insert(Bytes::from_static(b"nodes"), Value::bytes(b""));
        } else {
            let peers = self.peers.get_peers(&info_hash, self.config.k);
            if !peers.is_empty() {
                let values = peers
                    .iter()
                    .filter_map(|p| p.compact_addr().ok())
                    .map(|c| Value::bytes(&c))
                    .collect();
                body.insert(Bytes::from_static(b"values"), Value::List(values));
            } else {
                let nodes = self
                    .routing
                    .get_neighbor_compact_infos(&target, self.config.k);
                body.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(nodes)));
            }
        }

        self.reply(addr, make_response(tid, body)).await;

        if let Some(hook) = &self.config.hooks.on_get_peers {
            hook(info_hash, addr.ip(), addr.port());
        }
        true
    }

    async fn handle_announce_peer(
        &self,
        tid: &Bytes,
        args: &BTreeMap<Bytes, Value>,
        sender_id: &NodeId,
        addr: &SocketAddr,
    ) -> bool {
        let hash_bytes = args.get(b"info_hash".as_slice()).and_then(|v| v.as_bytes());
        let port = args.get(b"port".as_slice()).and_then(|v| v.as_integer());
        let token = args.get(b"token".as_slice()).and_then(|v| v.as_bytes());

        let (Some(hash_bytes), Some(port), Some(token)) = (hash_bytes, port, token) else {
            self.reply_error(tid, addr, KrpcError::protocol("lack of key"))
                .await;
            return false;
        };

        let Ok(info_hash) = InfoHash::from_bytes(hash_bytes) else {
            self.reply_error(tid, addr, KrpcError::protocol("invalid info_hash"))
                .await;
            return false;
        };

        // Invalid token: silent drop, no error reply.
        if !self.tokens.check(addr.ip(), token) {
            return false;
        }

        let implied = args
            .get(b"implied_port".as_slice())
            .and_then(|v| v.as_integer())
            .unwrap_or(0);
        let port = if implied != 0 {
            addr.port()
        } else {
            port.clamp(0, u16::MAX as i64) as u16
        };

        if self.config.is_standard() {
            self.peers.insert(
                info_hash,
                Peer::new(addr.ip(), port, token.clone()),
            );

            let mut body = BTreeMap::new();
            body.insert(
                Bytes::from_static(b"id"),
                Value::bytes(self.id_for(Some(sender_id)).as_bytes()),
            );
            self.reply(addr, make_response(tid, body)).await;
        }

        if let Some(hook) = &self.config.hooks.on_announce_peer {
            hook(info_hash, addr.ip(), port);
        }
        true
    }

    async fn handle_response(
        &self,
        tid: &Bytes,
        body: &BTreeMap<Bytes, Value>,
        addr: SocketAddr,
    ) {
        let Some(trans) = self.transactions.filter_one(tid, &addr) else {
            return;
        };

        let Some(id_bytes) = body.get(b"id".as_slice()).and_then(|v| v.as_bytes()) else {
            return;
        };
        let Ok(sender_id) = NodeId::from_bytes(id_bytes) else {
            return;
        };

        // Replying with a different id than the one we queried: evict.
        if let Some(expected) = trans.contact.id {
            if expected != sender_id {
                self.blacklist.insert(addr.ip(), Some(addr.port()));
                self.routing.remove_by_addr(&addr);
                return;
            }
        }

        match trans.query_type {
            QueryType::Ping | QueryType::AnnouncePeer => {}
            QueryType::FindNode => {
                let Some(target) = trans
                    .arg_bytes(b"target")
                    .and_then(|b| NodeId::from_bytes(b).ok())
                else {
                    return;
                };
                if self.find_on(body, &target, QueryType::FindNode).is_none() {
                    return;
                }
            }
            QueryType::GetPeers => {
                let Some(token) = body.get(b"token".as_slice()).and_then(|v| v.as_bytes())
                else {
                    return;
                };
                let Some(info_hash) = trans
                    .arg_bytes(b"info_hash")
                    .and_then(|b| InfoHash::from_bytes(b).ok())
                else {
                    return;
                };

                if let Some(values) = body.get(b"values".as_slice()).and_then(|v| v.as_list()) {
                    for value in values {
                        let Some(compact) = value.as_bytes() else {
                            continue;
                        };
                        let Ok(peer) = Peer::from_compact(compact, token.clone()) else {
                            continue;
                        };
                        self.peers.insert(info_hash, peer.clone());
                        if let Some(hook) = &self.config.hooks.on_get_peers_response {
                            hook(info_hash, peer);
                        }
                    }
                } else {
                    let target = NodeId(*info_hash.as_bytes());
                    if self.find_on(body, &target, QueryType::GetPeers).is_none() {
                        return;
                    }
                }
            }
        }

        trans.signal();
        self.blacklist.remove(addr.ip(), Some(addr.port()));
        self.routing.insert(Node::new(sender_id, addr));
    }

    fn handle_error(&self, tid: &Bytes, code: i64, message: &str, addr: SocketAddr) {
        debug!("krpc error {} from {}: {}", code, addr, message);
        if let Some(trans) = self.transactions.filter_one(tid, &addr) {
            trans.signal();
        }
    }

    /// Learns the nodes advertised in a response. Stops when the target
    /// was among them or nothing new was learned; otherwise re-issues the
    /// same query to the K neighbors closest to the target.
    fn find_on(
        &self,
        body: &BTreeMap<Bytes, Value>,
        target: &NodeId,
        query_type: QueryType,
    ) -> Option<()> {
        let nodes = body.get(b"nodes".as_slice()).and_then(|v| v.as_bytes())?;
        if nodes.len() % COMPACT_NODE_LEN != 0 {
            return None;
        }

        let mut has_new = false;
        let mut found = false;
        for chunk in nodes.chunks_exact(COMPACT_NODE_LEN) {
            let Ok(node) = Node::from_compact(chunk) else {
                continue;
            };
            if node.id == *target {
                found = true;
            }
            if self.routing.insert(node) {
                has_new = true;
            }
        }

        if found || !has_new {
            return Some(());
        }

        let info_hash = InfoHash(*target.as_bytes());
        for node in self.routing.get_neighbors(target, self.config.k) {
            let contact = Contact::from(&node);
            match query_type {
                QueryType::FindNode => self.transactions.find_node(&contact, target),
                QueryType::GetPeers => self.transactions.get_peers(&contact, &info_hash),
                _ => {}
            }
        }
        Some(())
    }
}

#[cfg(test)]
impl Dht {
    pub(crate) fn inner_routing(&self) -> &Arc<RoutingTable> {
        &self.inner.routing
    }

    pub(crate) fn inner_blacklist(&self) -> &Arc<BlackList> {
        &self.inner.blacklist
    }

    pub(crate) fn inner_peers(&self) -> &Arc<PeerIndex> {
        &self.inner.peers
    }
}

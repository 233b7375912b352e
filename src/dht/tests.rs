use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::message::{make_error, make_query, make_response, PROTOCOL_ERROR};
use super::node::{decode_compact_addr, encode_compact_addr};
use super::transaction::int_to_bytes;
use super::*;
use crate::bencode::Value;
use crate::constants::ID_BITS;
use crate::torrent::InfoHash;

fn addr(d: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, d)), port)
}

fn id_with_first_byte(b: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = b;
    NodeId(id)
}

// ---------------------------------------------------------------------------
// NodeId / Prefix
// ---------------------------------------------------------------------------

#[test]
fn test_node_id_bits() {
    let mut id = NodeId([0u8; 20]);
    assert_eq!(id.bit(0), 0);

    id.set_bit(0);
    assert_eq!(id.bit(0), 1);
    assert_eq!(id.0[0], 0x80);

    id.set_bit(15);
    assert_eq!(id.bit(15), 1);
    assert_eq!(id.0[1], 0x01);
}

#[test]
fn test_node_id_distance_laws() {
    let a = NodeId::generate();
    let b = NodeId::generate();

    // (a xor b) xor b = a
    let d = a.distance(&b);
    let mut back = [0u8; 20];
    for i in 0..20 {
        back[i] = d[i] ^ b.0[i];
    }
    assert_eq!(back, a.0);

    assert_eq!(a.distance(&a), [0u8; 20]);
}

#[test]
fn test_node_id_compare_prefix() {
    let a = id_with_first_byte(0b1010_0000);
    let b = id_with_first_byte(0b1011_0000);

    use std::cmp::Ordering;
    assert_eq!(a.compare_prefix(&b, 3), Ordering::Equal);
    assert_eq!(a.compare_prefix(&b, 4), Ordering::Less);
    assert_eq!(b.compare_prefix(&a, 4), Ordering::Greater);
    assert_eq!(a.compare_prefix(&a, ID_BITS), Ordering::Equal);
}

#[test]
fn test_node_id_derived() {
    let local = NodeId([0xaa; 20]);
    let target = NodeId([0x55; 20]);

    let derived = local.derived(&target);
    assert_eq!(&derived.0[..15], &[0xaa; 15]);
    assert_eq!(&derived.0[15..], &[0x55; 5]);
}

#[test]
fn test_prefix_child_and_matches() {
    let root = Prefix::root();
    assert_eq!(root.len(), 0);

    let one = root.child(1);
    assert_eq!(one.len(), 1);
    assert_eq!(one.bit(0), 1);

    let id = id_with_first_byte(0x80);
    assert!(one.matches(&id));
    assert!(!one.matches(&NodeId([0u8; 20])));

    let deeper = one.child(0).child(1);
    assert_eq!(deeper.len(), 3);
    assert!(deeper.matches(&id_with_first_byte(0b1010_0000)));
}

#[test]
fn test_prefix_random_child_id() {
    let prefix = Prefix::root().child(1).child(0).child(1);
    for _ in 0..32 {
        assert!(prefix.matches(&prefix.random_child_id()));
    }
}

// ---------------------------------------------------------------------------
// Compact codecs
// ---------------------------------------------------------------------------

#[test]
fn test_compact_addr_roundtrip() {
    let a = addr(7, 6881);
    let compact = encode_compact_addr(&a).unwrap();
    assert_eq!(compact, [192, 168, 1, 7, 0x1a, 0xe1]);
    assert_eq!(decode_compact_addr(&compact).unwrap(), a);
}

#[test]
fn test_compact_addr_rejects_ipv6() {
    let v6: SocketAddr = "[::1]:6881".parse().unwrap();
    assert!(encode_compact_addr(&v6).is_err());
}

#[test]
fn test_compact_addr_rejects_bad_length() {
    assert!(decode_compact_addr(&[1, 2, 3]).is_err());
    assert!(decode_compact_addr(&[1, 2, 3, 4, 5, 6, 7]).is_err());
}

#[test]
fn test_compact_node_roundtrip() {
    let node = Node::new(NodeId([3u8; 20]), addr(9, 1234));
    let compact = node.to_compact().unwrap();
    assert_eq!(compact.len(), 26);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, node.id);
    assert_eq!(parsed.addr, node.addr);
}

// ---------------------------------------------------------------------------
// BlackList
// ---------------------------------------------------------------------------

#[test]
fn test_blacklist_exact_and_wildcard() {
    let bl = BlackList::new(16);
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    bl.insert(ip, Some(6881));
    assert!(bl.contains(ip, 6881));
    assert!(!bl.contains(ip, 6882));

    bl.insert(ip, None);
    assert!(bl.contains(ip, 6882));
    assert!(bl.contains(ip, 1));

    bl.remove(ip, None);
    assert!(!bl.contains(ip, 6882));
    assert!(bl.contains(ip, 6881));
}

#[test]
fn test_blacklist_evicts_oldest() {
    let bl = BlackList::new(2);
    let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    let ip3 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));

    bl.insert(ip1, Some(1));
    bl.insert(ip2, Some(2));
    bl.insert(ip3, Some(3));

    assert_eq!(bl.len(), 2);
    assert!(!bl.contains(ip1, 1));
    assert!(bl.contains(ip2, 2));
    assert!(bl.contains(ip3, 3));
}

// ---------------------------------------------------------------------------
// TokenManager
// ---------------------------------------------------------------------------

#[test]
fn test_token_check_is_single_use() {
    let tm = TokenManager::new(Duration::from_secs(600));
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    let token = tm.token(ip);
    assert!(tm.check(ip, &token));
    // Consumed by the first check.
    assert!(!tm.check(ip, &token));
}

#[test]
fn test_token_wrong_value_consumes_entry() {
    let tm = TokenManager::new(Duration::from_secs(600));
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    let token = tm.token(ip);
    assert!(!tm.check(ip, b"nope"));
    assert!(!tm.check(ip, &token));
}

#[test]
fn test_token_stable_until_expiry() {
    let tm = TokenManager::new(Duration::from_secs(600));
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    assert_eq!(tm.token(ip), tm.token(ip));
}

#[test]
fn test_token_expiry_sweep() {
    let tm = TokenManager::new(Duration::ZERO);
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    tm.token(ip);
    std::thread::sleep(Duration::from_millis(5));
    tm.clear_expired();
    assert!(tm.is_empty());
}

// ---------------------------------------------------------------------------
// PeerIndex
// ---------------------------------------------------------------------------

#[test]
fn test_peer_index_dedupes_by_endpoint() {
    let index = PeerIndex::new(8);
    let hash = InfoHash([1u8; 20]);
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    index.insert(hash, Peer::new(ip, 6881, Bytes::from_static(b"a")));
    index.insert(hash, Peer::new(ip, 6881, Bytes::from_static(b"b")));

    let peers = index.get_peers(&hash, 8);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].token.as_ref(), b"b");
}

#[test]
fn test_peer_index_bounded_drops_front() {
    let index = PeerIndex::new(2);
    let hash = InfoHash([1u8; 20]);

    for i in 1..=3 {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, i));
        index.insert(hash, Peer::new(ip, 6881, Bytes::new()));
    }

    let peers = index.get_peers(&hash, 8);
    assert_eq!(peers.len(), 2);
    // Oldest (10.0.0.1) dropped, newest last.
    assert_eq!(peers[1].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
}

#[test]
fn test_peer_index_returns_newest_n() {
    let index = PeerIndex::new(8);
    let hash = InfoHash([1u8; 20]);

    for i in 1..=4 {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, i));
        index.insert(hash, Peer::new(ip, 6881, Bytes::new()));
    }

    let peers = index.get_peers(&hash, 2);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
    assert_eq!(peers[1].ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)));
}

// ---------------------------------------------------------------------------
// RoutingTable
// ---------------------------------------------------------------------------

fn table(bucket_size: usize, max_nodes: usize) -> RoutingTable {
    RoutingTable::new(
        bucket_size,
        max_nodes,
        Duration::from_secs(900),
        Duration::from_secs(900),
        Arc::new(BlackList::new(64)),
    )
}

#[test]
fn test_routing_insert_reports_new() {
    let rt = table(8, 100);
    let node = Node::new(id_with_first_byte(1), addr(1, 6881));

    assert!(rt.insert(node.clone()));
    assert!(!rt.insert(node));
    assert_eq!(rt.len(), 1);
}

#[test]
fn test_routing_rejects_blacklisted() {
    let blacklist = Arc::new(BlackList::new(64));
    let rt = RoutingTable::new(
        8,
        100,
        Duration::from_secs(900),
        Duration::from_secs(900),
        blacklist.clone(),
    );

    let node = Node::new(id_with_first_byte(1), addr(1, 6881));
    blacklist.insert(node.addr.ip(), None);

    assert!(!rt.insert(node));
    assert!(rt.is_empty());
}

#[test]
fn test_routing_respects_max_nodes() {
    let rt = table(64, 2);

    for i in 0..4 {
        rt.insert(Node::new(id_with_first_byte(i), addr(i, 6881)));
    }
    assert_eq!(rt.len(), 2);
}

#[test]
fn test_routing_bucket_split() {
    // Bucket size 2; ids 0x00.. and 0x40.. share bit 0 = 0, 0x80.. differs.
    let rt = table(2, 100);

    rt.insert(Node::new(id_with_first_byte(0x00), addr(1, 6881)));
    rt.insert(Node::new(id_with_first_byte(0x80), addr(2, 6881)));
    assert_eq!(rt.bucket_count(), 1);

    rt.insert(Node::new(id_with_first_byte(0x40), addr(3, 6881)));

    assert_eq!(rt.bucket_count(), 2);
    assert_eq!(rt.len(), 3);
    assert!(rt.check_prefix_invariant());
}

#[test]
fn test_routing_cache_matches_leaves() {
    let rt = table(2, 1000);

    for i in 0u8..32 {
        let mut id = [0u8; 20];
        id[0] = i.wrapping_mul(37);
        id[1] = i;
        rt.insert(Node::new(NodeId(id), addr(i, 6881)));
    }

    assert_eq!(rt.len(), rt.leaf_node_count());
    assert!(rt.check_prefix_invariant());
}

#[test]
fn test_routing_remove() {
    let rt = table(8, 100);
    let node = Node::new(id_with_first_byte(5), addr(5, 6881));

    rt.insert(node.clone());
    rt.remove(&node.id);

    assert!(rt.is_empty());
    assert!(rt.get_node_by_id(&node.id).is_none());
    assert!(rt.get_node_by_addr(&node.addr).is_none());
    assert_eq!(rt.len(), rt.leaf_node_count());
}

#[test]
fn test_routing_remove_by_addr() {
    let rt = table(8, 100);
    let node = Node::new(id_with_first_byte(5), addr(5, 6881));

    rt.insert(node.clone());
    rt.remove_by_addr(&node.addr);
    assert!(rt.is_empty());
}

#[test]
fn test_routing_id_update_keeps_cache_coherent() {
    let rt = table(8, 100);
    let id = id_with_first_byte(5);

    rt.insert(Node::new(id, addr(5, 6881)));
    // Same id shows up from a new address.
    rt.insert(Node::new(id, addr(6, 6881)));

    assert_eq!(rt.len(), 1);
    assert!(rt.get_node_by_addr(&addr(5, 6881)).is_none());
    assert!(rt.get_node_by_addr(&addr(6, 6881)).is_some());
    assert_eq!(rt.len(), rt.leaf_node_count());
}

#[test]
fn test_routing_get_neighbors_sorted_by_distance() {
    let rt = table(64, 1000);

    for i in 1..=16u8 {
        rt.insert(Node::new(id_with_first_byte(i), addr(i, 6881)));
    }

    let target = NodeId([0u8; 20]);
    let neighbors = rt.get_neighbors(&target, 4);

    assert_eq!(neighbors.len(), 4);
    let dists: Vec<_> = neighbors.iter().map(|n| target.distance(&n.id)).collect();
    let mut sorted = dists.clone();
    sorted.sort();
    assert_eq!(dists, sorted);
    assert_eq!(neighbors[0].id, id_with_first_byte(1));
}

#[test]
fn test_routing_crawl_refresh_churns() {
    let rt = RoutingTable::new(
        usize::MAX,
        1000,
        Duration::ZERO,
        Duration::ZERO,
        Arc::new(BlackList::new(64)),
    );

    for i in 1..=4u8 {
        rt.insert(Node::new(id_with_first_byte(i), addr(i, 6881)));
    }

    let plan = rt.refresh_plan(8, true);
    assert_eq!(plan.len(), 4);
    assert!(rt.is_empty());
}

#[test]
fn test_routing_standard_refresh_keeps_nodes() {
    let rt = RoutingTable::new(
        8,
        1000,
        Duration::ZERO,
        Duration::ZERO,
        Arc::new(BlackList::new(64)),
    );

    for i in 1..=4u8 {
        rt.insert(Node::new(id_with_first_byte(i), addr(i, 6881)));
    }

    let plan = rt.refresh_plan(2, false);
    assert_eq!(plan.len(), 2);
    assert_eq!(rt.len(), 4);
}

// ---------------------------------------------------------------------------
// KRPC messages
// ---------------------------------------------------------------------------

#[test]
fn test_krpc_ping_reply_layout() {
    // The BEP-5 ping reply, byte for byte.
    let local = NodeId([0u8; 20]);
    let mut body = BTreeMap::new();
    body.insert(Bytes::from_static(b"id"), Value::bytes(local.as_bytes()));

    let encoded = make_response(b"\x00\x01", body).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(b"d1:rd2:id20:");
    expected.extend_from_slice(&[0u8; 20]);
    expected.extend_from_slice(b"e1:t2:\x00\x011:y1:re");
    assert_eq!(encoded, expected);
}

#[test]
fn test_krpc_query_roundtrip() {
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(&[7u8; 20]));
    args.insert(Bytes::from_static(b"target"), Value::bytes(&[9u8; 20]));

    let encoded = make_query(b"ab", QueryType::FindNode, args).unwrap();
    let msg = KrpcMessage::parse(&encoded).unwrap();

    assert_eq!(msg.transaction_id.as_ref(), b"ab");
    let KrpcPayload::Query(dict) = msg.payload else {
        panic!("expected query");
    };
    assert_eq!(
        dict.get(b"q".as_slice()).and_then(|v| v.as_str()),
        Some("find_node")
    );
    let args = dict.get(b"a".as_slice()).and_then(|v| v.as_dict()).unwrap();
    assert_eq!(
        args.get(b"target".as_slice()).and_then(|v| v.as_bytes()).unwrap().as_ref(),
        &[9u8; 20]
    );
}

#[test]
fn test_krpc_error_roundtrip() {
    let encoded = make_error(b"cd", &KrpcError::protocol("invalid id")).unwrap();
    let msg = KrpcMessage::parse(&encoded).unwrap();

    let KrpcPayload::Error { code, message } = msg.payload else {
        panic!("expected error");
    };
    assert_eq!(code, PROTOCOL_ERROR);
    assert_eq!(message, "invalid id");
}

#[test]
fn test_krpc_parse_rejects_malformed() {
    assert!(KrpcMessage::parse(b"i42e").is_err());
    assert!(KrpcMessage::parse(b"d1:y1:qe").is_err());
    assert!(KrpcMessage::parse(b"d1:t2:aa1:y1:xe").is_err());
    // Error payload must be a two-element list.
    assert!(KrpcMessage::parse(b"d1:el1:ae1:t2:aa1:y1:ee").is_err());
}

#[test]
fn test_query_type_strings() {
    for qt in [
        QueryType::Ping,
        QueryType::FindNode,
        QueryType::GetPeers,
        QueryType::AnnouncePeer,
    ] {
        assert_eq!(QueryType::parse(qt.as_str()), Some(qt));
    }
    assert_eq!(QueryType::parse("vote"), None);
}

// ---------------------------------------------------------------------------
// Transaction ids
// ---------------------------------------------------------------------------

#[test]
fn test_int_to_bytes_minimal_width() {
    assert_eq!(int_to_bytes(0), vec![0]);
    assert_eq!(int_to_bytes(1), vec![1]);
    assert_eq!(int_to_bytes(255), vec![255]);
    assert_eq!(int_to_bytes(256), vec![1, 0]);
    assert_eq!(int_to_bytes(0x0102_0304), vec![1, 2, 3, 4]);
    assert_eq!(int_to_bytes(u32::MAX as u64), vec![255, 255, 255, 255]);
}

// ---------------------------------------------------------------------------
// Loopback scenarios
// ---------------------------------------------------------------------------

use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn loopback_config(mode: Mode) -> Config {
    let mut config = match mode {
        Mode::Standard => Config::standard(),
        Mode::Crawl => Config::crawl(),
    };
    config.address = "127.0.0.1:0".to_string();
    config.prime_nodes = Vec::new();
    // Keep the refresh tick out of short-lived tests.
    config.check_kbucket_period = Duration::from_secs(300);
    config
}

async fn spawn_dht(config: Config) -> (Dht, SocketAddr) {
    let dht = Dht::bind(config).await.unwrap();
    let addr = dht.local_addr().unwrap();
    let runner = dht.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (dht, addr)
}

async fn exchange(sock: &UdpSocket, to: SocketAddr, data: &[u8]) -> Vec<u8> {
    sock.send_to(data, to).await.unwrap();
    let mut buf = vec![0u8; 65535];
    let (n, _) = timeout(RECV_TIMEOUT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    buf.truncate(n);
    buf
}

fn ping_packet(tid: &[u8], sender: &NodeId) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(sender.as_bytes()));
    make_query(tid, QueryType::Ping, args).unwrap()
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (dht, dht_addr) = spawn_dht(loopback_config(Mode::Standard)).await;
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_id = NodeId([0xff; 20]);

    let reply = exchange(&sock, dht_addr, &ping_packet(b"\x00\x01", &remote_id)).await;

    let mut expected = Vec::new();
    expected.extend_from_slice(b"d1:rd2:id20:");
    expected.extend_from_slice(dht.local_id().as_bytes());
    expected.extend_from_slice(b"e1:t2:\x00\x011:y1:re");
    assert_eq!(reply, expected);

    // The sender got learned. The insert happens just after the reply is
    // sent, so poll briefly.
    let local = sock.local_addr().unwrap();
    let mut node = None;
    for _ in 0..100 {
        if let Some(n) = dht.inner_routing().get_node_by_addr(&local) {
            node = Some(n);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.expect("sender not learned").id, remote_id);
}

#[tokio::test]
async fn test_id_change_evicts_and_blacklists() {
    let (dht, dht_addr) = spawn_dht(loopback_config(Mode::Standard)).await;
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = sock.local_addr().unwrap();

    let reply = exchange(&sock, dht_addr, &ping_packet(b"aa", &NodeId([0x11; 20]))).await;
    assert!(KrpcMessage::parse(&reply).is_ok());

    // Wait until the first id is registered for the address.
    for _ in 0..100 {
        if dht.inner_routing().get_node_by_addr(&local).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Same address, different id.
    let reply = exchange(&sock, dht_addr, &ping_packet(b"bb", &NodeId([0x22; 20]))).await;
    let msg = KrpcMessage::parse(&reply).unwrap();
    let KrpcPayload::Error { code, .. } = msg.payload else {
        panic!("expected protocol error");
    };
    assert_eq!(code, PROTOCOL_ERROR);

    assert!(dht.inner_blacklist().contains(local.ip(), local.port()));
    assert!(dht.inner_routing().get_node_by_addr(&local).is_none());
}

#[tokio::test]
async fn test_token_binds_announce() {
    let (dht, dht_addr) = spawn_dht(loopback_config(Mode::Standard)).await;
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = sock.local_addr().unwrap();
    let remote_id = NodeId([0x33; 20]);
    let info_hash = InfoHash([0xab; 20]);

    // get_peers hands out a token.
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(remote_id.as_bytes()));
    args.insert(
        Bytes::from_static(b"info_hash"),
        Value::bytes(info_hash.as_bytes()),
    );
    let reply = exchange(
        &sock,
        dht_addr,
        &make_query(b"t1", QueryType::GetPeers, args).unwrap(),
    )
    .await;

    let msg = KrpcMessage::parse(&reply).unwrap();
    let KrpcPayload::Response(body) = msg.payload else {
        panic!("expected response");
    };
    let token = body
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .unwrap()
        .clone();

    // announce_peer with that token lands in the peer index.
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(remote_id.as_bytes()));
    args.insert(
        Bytes::from_static(b"info_hash"),
        Value::bytes(info_hash.as_bytes()),
    );
    args.insert(Bytes::from_static(b"port"), Value::Integer(6881));
    args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
    let reply = exchange(
        &sock,
        dht_addr,
        &make_query(b"t2", QueryType::AnnouncePeer, args.clone()).unwrap(),
    )
    .await;
    assert!(matches!(
        KrpcMessage::parse(&reply).unwrap().payload,
        KrpcPayload::Response(_)
    ));

    let peers = dht.inner_peers().get_peers(&info_hash, 8);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].ip, local.ip());
    assert_eq!(peers[0].port, 6881);

    // The token was consumed: a replay is silently dropped.
    let mut replay = args;
    replay.insert(Bytes::from_static(b"port"), Value::Integer(6882));
    sock.send_to(
        &make_query(b"t3", QueryType::AnnouncePeer, replay).unwrap(),
        dht_addr,
    )
    .await
    .unwrap();

    let mut buf = vec![0u8; 1024];
    assert!(
        timeout(Duration::from_millis(500), sock.recv_from(&mut buf))
            .await
            .is_err()
    );
    let peers = dht.inner_peers().get_peers(&info_hash, 8);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].port, 6881);
}

#[tokio::test]
async fn test_crawl_get_peers_reply_attracts_announce() {
    let mut config = loopback_config(Mode::Crawl);
    let (announce_tx, announce_rx) = std::sync::mpsc::channel();
    config.hooks.on_announce_peer = Some(Arc::new(move |hash, ip, port| {
        let _ = announce_tx.send((hash, ip, port));
    }));
    let (_dht, dht_addr) = spawn_dht(config).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = sock.local_addr().unwrap();
    let remote_id = NodeId([0x44; 20]);
    let info_hash = InfoHash([0xcd; 20]);

    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(remote_id.as_bytes()));
    args.insert(
        Bytes::from_static(b"info_hash"),
        Value::bytes(info_hash.as_bytes()),
    );
    let reply = exchange(
        &sock,
        dht_addr,
        &make_query(b"g1", QueryType::GetPeers, args).unwrap(),
    )
    .await;

    // Crawl replies carry a token and empty nodes, never values.
    let msg = KrpcMessage::parse(&reply).unwrap();
    let KrpcPayload::Response(body) = msg.payload else {
        panic!("expected response");
    };
    let token = body
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .unwrap()
        .clone();
    assert_eq!(
        body.get(b"nodes".as_slice()).and_then(|v| v.as_bytes()).unwrap().len(),
        0
    );
    assert!(!body.contains_key(b"values".as_slice()));

    // The announce that follows reaches the hook with the implied port.
    let mut args = BTreeMap::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(remote_id.as_bytes()));
    args.insert(
        Bytes::from_static(b"info_hash"),
        Value::bytes(info_hash.as_bytes()),
    );
    args.insert(Bytes::from_static(b"port"), Value::Integer(9999));
    args.insert(Bytes::from_static(b"implied_port"), Value::Integer(1));
    args.insert(Bytes::from_static(b"token"), Value::Bytes(token));
    sock.send_to(
        &make_query(b"g2", QueryType::AnnouncePeer, args).unwrap(),
        dht_addr,
    )
    .await
    .unwrap();

    let (hash, ip, port) = timeout(RECV_TIMEOUT, async move {
        tokio::task::spawn_blocking(move || announce_rx.recv().unwrap())
            .await
            .unwrap()
    })
    .await
    .unwrap();

    assert_eq!(hash, info_hash);
    assert_eq!(ip, local.ip());
    assert_eq!(port, local.port());
}

#[tokio::test]
async fn test_find_node_recursion() {
    // Sockets B and C are advertised by A's find_node response; both must
    // then receive the same lookup, and A must not be asked again.
    let sock_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sock_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sock_c = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut config = loopback_config(Mode::Standard);
    config.prime_nodes = vec![sock_a.local_addr().unwrap().to_string()];
    let (dht, _dht_addr) = spawn_dht(config).await;
    let target = *dht.local_id();

    // A receives the bootstrap lookup.
    let mut buf = vec![0u8; 65535];
    let (n, from) = timeout(RECV_TIMEOUT, sock_a.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let msg = KrpcMessage::parse(&buf[..n]).unwrap();
    let KrpcPayload::Query(dict) = msg.payload else {
        panic!("expected query");
    };
    assert_eq!(
        dict.get(b"q".as_slice()).and_then(|v| v.as_str()),
        Some("find_node")
    );

    // A advertises B and C as neighbors.
    let node_b = Node::new(NodeId([0xb0; 20]), sock_b.local_addr().unwrap());
    let node_c = Node::new(NodeId([0xc0; 20]), sock_c.local_addr().unwrap());
    let mut nodes = Vec::new();
    nodes.extend_from_slice(&node_b.to_compact().unwrap());
    nodes.extend_from_slice(&node_c.to_compact().unwrap());

    let mut body = BTreeMap::new();
    body.insert(Bytes::from_static(b"id"), Value::bytes(&[0xa0; 20]));
    body.insert(Bytes::from_static(b"nodes"), Value::Bytes(Bytes::from(nodes)));
    sock_a
        .send_to(
            &make_response(&msg.transaction_id, body).unwrap(),
            from,
        )
        .await
        .unwrap();

    // Both B and C get find_node for the same target.
    for sock in [&sock_b, &sock_c] {
        let (n, _) = timeout(RECV_TIMEOUT, sock.recv_from(&mut buf))
            .await
            .expect("advertised node never queried")
            .unwrap();
        let msg = KrpcMessage::parse(&buf[..n]).unwrap();
        let KrpcPayload::Query(dict) = msg.payload else {
            panic!("expected query");
        };
        assert_eq!(
            dict.get(b"q".as_slice()).and_then(|v| v.as_str()),
            Some("find_node")
        );
        let args = dict.get(b"a".as_slice()).and_then(|v| v.as_dict()).unwrap();
        assert_eq!(
            args.get(b"target".as_slice())
                .and_then(|v| v.as_bytes())
                .unwrap()
                .as_ref(),
            target.as_bytes()
        );
    }

    // No follow-up lookup goes back to A.
    assert!(
        timeout(Duration::from_millis(500), sock_a.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_transaction_dedup_per_type_and_address() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let blacklist = Arc::new(BlackList::new(64));
    let routing = Arc::new(RoutingTable::new(
        8,
        100,
        Duration::from_secs(900),
        Duration::from_secs(900),
        blacklist.clone(),
    ));
    let local_id = NodeId::generate();
    let manager = Arc::new(TransactionManager::new(
        local_id,
        false,
        2,
        u32::MAX as u64,
        64,
        socket,
        routing,
        blacklist,
    ));
    tokio::spawn(manager.clone().run());

    // Nothing listens on this port; the drivers just sit in their wait.
    let dead: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let contact = Contact::new(Some(NodeId([0x77; 20])), dead);
    let hash = InfoHash([0x99; 20]);

    manager.get_peers(&contact, &hash);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.len(), 1);

    // Same (type, address) pair is deduped.
    manager.get_peers(&contact, &hash);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.len(), 1);

    // A different type to the same address is allowed.
    manager.find_node(&contact, &local_id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.len(), 2);

    // Queries to ourselves never leave.
    manager.ping(&Contact::new(Some(local_id), dead));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.len(), 2);
}

#[tokio::test]
async fn test_transaction_ids_distinct() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let blacklist = Arc::new(BlackList::new(64));
    let routing = Arc::new(RoutingTable::new(
        8,
        100,
        Duration::from_secs(900),
        Duration::from_secs(900),
        blacklist.clone(),
    ));
    let manager = TransactionManager::new(
        NodeId::generate(),
        false,
        2,
        u32::MAX as u64,
        64,
        socket,
        routing,
        blacklist,
    );

    let mut seen = std::collections::HashSet::new();
    for _ in 0..4096 {
        assert!(seen.insert(manager.gen_trans_id()));
    }
}

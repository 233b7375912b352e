use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::node::Peer;
use crate::torrent::InfoHash;

/// Peers per infohash, deduped by compact endpoint, newest at the back,
/// bounded by K (the front is dropped on overflow).
pub struct PeerIndex {
    max_per_hash: usize,
    table: Mutex<HashMap<InfoHash, VecDeque<Peer>>>,
}

impl PeerIndex {
    pub fn new(max_per_hash: usize) -> Self {
        Self {
            max_per_hash,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, info_hash: InfoHash, peer: Peer) {
        let Ok(key) = peer.compact_addr() else {
            return;
        };

        let mut table = self.table.lock();
        let queue = table.entry(info_hash).or_default();

        queue.retain(|p| p.compact_addr().map(|k| k != key).unwrap_or(true));
        queue.push_back(peer);

        while queue.len() > self.max_per_hash {
            queue.pop_front();
        }
    }

    /// Up to `n` peers for `info_hash`, newest last.
    pub fn get_peers(&self, info_hash: &InfoHash, n: usize) -> Vec<Peer> {
        let table = self.table.lock();
        let Some(queue) = table.get(info_hash) else {
            return Vec::new();
        };

        let skip = queue.len().saturating_sub(n);
        queue.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

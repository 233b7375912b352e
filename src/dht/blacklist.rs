use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

/// Key is `(ip, port)`; a `None` port is a wildcard entry matching every
/// port of that ip.
type Key = (IpAddr, Option<u16>);

struct Inner {
    entries: HashMap<Key, Instant>,
    order: VecDeque<Key>,
}

/// A bounded set of misbehaving endpoints.
///
/// Oldest entries are evicted once the configured size is reached.
/// Suppresses repeatedly failing or id-lying peers in both the DHT and the
/// metadata fetcher.
pub struct BlackList {
    max_size: usize,
    inner: Mutex<Inner>,
}

impl BlackList {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Inserts an endpoint. `None` blocks every port for the ip.
    pub fn insert(&self, ip: IpAddr, port: Option<u16>) {
        let key = (ip, port);
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(&key) {
            return;
        }

        while inner.entries.len() >= self.max_size {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.entries.insert(key, Instant::now());
        inner.order.push_back(key);
    }

    /// True if the exact entry exists or a wildcard entry covers the ip.
    pub fn contains(&self, ip: IpAddr, port: u16) -> bool {
        let inner = self.inner.lock();
        inner.entries.contains_key(&(ip, Some(port))) || inner.entries.contains_key(&(ip, None))
    }

    pub fn remove(&self, ip: IpAddr, port: Option<u16>) {
        let key = (ip, port);
        let mut inner = self.inner.lock();
        if inner.entries.remove(&key).is_some() {
            inner.order.retain(|k| *k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng as _;

use crate::constants::TOKEN_LEN;

struct Token {
    data: Bytes,
    created_at: Instant,
}

/// Mints and checks the anti-spoof tokens required by `announce_peer`.
///
/// One token per remote ip. A token is valid until `expired_after` and is
/// consumed by a successful (or attempted) check, so each mint passes
/// verification at most once.
pub struct TokenManager {
    expired_after: Duration,
    tokens: Mutex<HashMap<IpAddr, Token>>,
}

impl TokenManager {
    pub fn new(expired_after: Duration) -> Self {
        Self {
            expired_after,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// The current token for `ip`, minting a fresh one if none exists or
    /// the stored one has expired.
    pub fn token(&self, ip: IpAddr) -> Bytes {
        let mut tokens = self.tokens.lock();

        match tokens.get(&ip) {
            Some(tk) if tk.created_at.elapsed() <= self.expired_after => tk.data.clone(),
            _ => {
                let mut data = [0u8; TOKEN_LEN];
                rand::rng().fill(&mut data[..]);
                let data = Bytes::copy_from_slice(&data);
                tokens.insert(
                    ip,
                    Token {
                        data: data.clone(),
                        created_at: Instant::now(),
                    },
                );
                data
            }
        }
    }

    /// True iff a token is stored for `ip` and equals `candidate`. The
    /// stored entry is removed either way.
    pub fn check(&self, ip: IpAddr, candidate: &[u8]) -> bool {
        match self.tokens.lock().remove(&ip) {
            Some(tk) => tk.data == candidate,
            None => false,
        }
    }

    /// Drops expired entries. Run periodically by the server.
    pub fn clear_expired(&self) {
        self.tokens
            .lock()
            .retain(|_, tk| tk.created_at.elapsed() <= self.expired_after);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::cmp::Ordering;
use std::fmt;

use rand::Rng as _;

use super::error::DhtError;
use crate::constants::{ID_BITS, ID_LEN};

/// A 160-bit node identifier, indexed MSB-first.
///
/// Also used for info hashes when they act as lookup targets: both live in
/// the same XOR metric space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Reads bit `i`, where bit 0 is the most significant bit.
    pub fn bit(&self, i: usize) -> usize {
        debug_assert!(i < ID_BITS);
        ((self.0[i / 8] >> (7 - i % 8)) & 1) as usize
    }

    /// Sets bit `i` to 1.
    pub fn set_bit(&mut self, i: usize) {
        debug_assert!(i < ID_BITS);
        self.0[i / 8] |= 1 << (7 - i % 8);
    }

    /// XOR distance to `other`. Big-endian byte order, so plain slice
    /// comparison orders distances as unsigned 160-bit integers.
    pub fn distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Compares the top `bits` bits of `self` and `other` as unsigned
    /// integers.
    pub fn compare_prefix(&self, other: &NodeId, bits: usize) -> Ordering {
        debug_assert!(bits <= ID_BITS);
        let full = bits / 8;
        match self.0[..full].cmp(&other.0[..full]) {
            Ordering::Equal => {}
            ord => return ord,
        }

        let rem = bits % 8;
        if rem == 0 {
            return Ordering::Equal;
        }

        let mask = 0xffu8 << (8 - rem);
        (self.0[full] & mask).cmp(&(other.0[full] & mask))
    }

    /// An id near `target`: the first 15 local bytes with the target's
    /// last 5, so replies appear to come from a neighbor of the key.
    pub fn derived(&self, target: &NodeId) -> NodeId {
        let mut id = self.0;
        id[15..].copy_from_slice(&target.0[15..]);
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A bucket-owned id prefix: the top `len` bits are significant, the rest
/// are zero.
#[derive(Clone, PartialEq, Eq)]
pub struct Prefix {
    bits: [u8; ID_LEN],
    len: usize,
}

impl Prefix {
    /// The zero-length prefix owned by the root bucket.
    pub fn root() -> Self {
        Self {
            bits: [0u8; ID_LEN],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, i: usize) -> usize {
        debug_assert!(i < self.len);
        ((self.bits[i / 8] >> (7 - i % 8)) & 1) as usize
    }

    /// Extends this prefix by one bit whose value is `bit`.
    pub fn child(&self, bit: usize) -> Self {
        debug_assert!(self.len < ID_BITS);
        let mut next = Self {
            bits: self.bits,
            len: self.len + 1,
        };
        if bit != 0 {
            next.bits[self.len / 8] |= 1 << (7 - self.len % 8);
        }
        next
    }

    /// Whether `id` shares all `len` prefix bits.
    pub fn matches(&self, id: &NodeId) -> bool {
        self.matches_bits(id, self.len)
    }

    /// Whether `id` shares the first `bits` prefix bits (`bits <= len`).
    pub fn matches_bits(&self, id: &NodeId, bits: usize) -> bool {
        debug_assert!(bits <= self.len);
        NodeId(self.bits).compare_prefix(id, bits) == Ordering::Equal
    }

    /// A random id carrying exactly this prefix, used for refresh lookups.
    pub fn random_child_id(&self) -> NodeId {
        let mut id = NodeId::generate();
        let full = self.len / 8;
        id.0[..full].copy_from_slice(&self.bits[..full]);

        let rem = self.len % 8;
        if rem > 0 {
            let mask = 0xffu8 << (8 - rem);
            id.0[full] = (self.bits[full] & mask) | (id.0[full] & !mask);
        }
        id
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix(")?;
        for i in 0..self.len {
            write!(f, "{}", self.bit(i))?;
        }
        write!(f, ")")
    }
}

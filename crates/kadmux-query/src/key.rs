//! 256-bit keys, the XOR distance metric, and node identity.
//!
//! Every participant and every lookup target lives in the same 256-bit
//! keyspace. Closeness is the XOR of two keys read as an unsigned big-endian
//! integer, so comparing the raw distance bytes lexicographically gives the
//! right ordering.

use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Length of a key in bytes.
pub const KEY_LEN: usize = 32;

/// A point in the 256-bit Kademlia keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub [u8; KEY_LEN]);

impl Key {
    /// Wrap raw key bytes.
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Return the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Compute the XOR distance between two keys.
    pub fn distance(&self, other: &Key) -> Distance {
        let mut result = [0u8; KEY_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// XOR distance between two keys. Smaller is closer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance(pub [u8; KEY_LEN]);

impl Distance {
    /// The distance from a key to itself.
    pub const ZERO: Distance = Distance([0u8; KEY_LEN]);

    /// Return the raw distance bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// An opaque node identifier that can be placed in the keyspace.
pub trait NodeId: Clone + Eq + Hash + fmt::Debug {
    /// The node's position in the keyspace.
    fn key(&self) -> Key;
}

/// A bare key is its own identity. Useful for simulations and tests.
impl NodeId for Key {
    fn key(&self) -> Key {
        *self
    }
}

/// A node identifier plus the endpoints it can be reached at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo<N> {
    /// The node's identifier.
    pub id: N,
    /// Known network endpoints. May be empty.
    pub addrs: Vec<SocketAddr>,
}

impl<N: NodeId> NodeInfo<N> {
    /// Create node info with the given endpoints.
    pub fn new(id: N, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }

    /// Create node info with no known endpoints.
    pub fn without_addrs(id: N) -> Self {
        Self {
            id,
            addrs: Vec::new(),
        }
    }

    /// The node's position in the keyspace.
    pub fn key(&self) -> Key {
        self.id.key()
    }
}

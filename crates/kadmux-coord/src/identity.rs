//! Concrete peer identity used at the network boundary.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use kadmux_query::{Key, NodeId};
use serde::{Deserialize, Serialize};

use crate::conversion::ConversionError;

/// Length of a peer's public key in bytes.
pub const PEER_ID_LEN: usize = 32;

/// A peer identity: the peer's Ed25519 public key.
///
/// The peer's position in the keyspace is `BLAKE3(public_key)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap a public key.
    pub const fn from_public_key(public_key: [u8; PEER_ID_LEN]) -> Self {
        Self(public_key)
    }

    /// Parse a peer id from untyped bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConversionError> {
        let public_key: [u8; PEER_ID_LEN] =
            bytes.try_into().map_err(|_| ConversionError::InvalidLength {
                expected: PEER_ID_LEN,
                got: bytes.len(),
            })?;
        Ok(Self(public_key))
    }

    /// The raw public key.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl NodeId for PeerId {
    fn key(&self) -> Key {
        Key::new(*blake3::hash(&self.0).as_bytes())
    }
}

impl FromStr for PeerId {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..4]))
    }
}

/// A peer identity plus the endpoints it can be dialled at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    /// The peer's identity.
    pub id: PeerId,
    /// Known endpoints. May be empty.
    pub addrs: Vec<SocketAddr>,
}

impl AddrInfo {
    /// Create address info for `id`.
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

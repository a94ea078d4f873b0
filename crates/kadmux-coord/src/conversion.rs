//! Conversions between the generic query types and [`AddrInfo`].
//!
//! The pool is instantiated over [`PeerId`], so converting its output back to
//! network-facing values cannot fail. Identities that arrive untyped (raw
//! bytes, hex strings, address strings) are parsed here, and a value of the
//! wrong shape is rejected with a [`ConversionError`]. Such an error means
//! the caller was wired to the wrong peer representation; callers should
//! abort the operation rather than retry.

use std::net::{AddrParseError, SocketAddr};

use kadmux_query::NodeInfo;

use crate::identity::{AddrInfo, PeerId};

/// Failure to interpret a value as a peer identity or endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// The identity has the wrong number of bytes.
    #[error("invalid peer id length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// The identity is not valid hex.
    #[error("invalid peer id encoding: {0}")]
    InvalidEncoding(#[from] hex::FromHexError),

    /// An endpoint is not a socket address.
    #[error("invalid address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: AddrParseError,
    },
}

impl AddrInfo {
    /// Parse address info from a hex-encoded peer id and endpoint strings.
    pub fn parse(id: &str, addrs: &[&str]) -> Result<Self, ConversionError> {
        let id: PeerId = id.parse()?;
        let addrs = addrs
            .iter()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|source| ConversionError::InvalidAddress {
                        addr: (*addr).to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { id, addrs })
    }
}

impl From<NodeInfo<PeerId>> for AddrInfo {
    fn from(info: NodeInfo<PeerId>) -> Self {
        Self {
            id: info.id,
            addrs: info.addrs,
        }
    }
}

impl From<AddrInfo> for NodeInfo<PeerId> {
    fn from(info: AddrInfo) -> Self {
        NodeInfo::new(info.id, info.addrs)
    }
}

/// A peer with no known endpoints.
impl From<PeerId> for AddrInfo {
    fn from(id: PeerId) -> Self {
        Self {
            id,
            addrs: Vec::new(),
        }
    }
}

/// Convert a list of [`AddrInfo`] into generic node info.
pub fn addr_infos_to_node_infos(infos: Vec<AddrInfo>) -> Vec<NodeInfo<PeerId>> {
    infos.into_iter().map(NodeInfo::from).collect()
}

/// Convert a list of generic node info into [`AddrInfo`].
pub fn node_infos_to_addr_infos(infos: Vec<NodeInfo<PeerId>>) -> Vec<AddrInfo> {
    infos.into_iter().map(AddrInfo::from).collect()
}

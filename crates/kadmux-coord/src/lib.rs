//! # kadmux-coord
//!
//! Coordination layer between an asynchronous network event loop and the
//! synchronous query [`Pool`](kadmux_query::Pool).
//!
//! [`PooledQueryBehaviour`] accepts events from any number of tasks, drives
//! the pool under a single lock, buffers the resulting outbound events in
//! FIFO order and signals a single-slot readiness flag so the driver loop
//! knows when to call [`PooledQueryBehaviour::perform`]. Callers that start a
//! query with a [`Waiter`] receive progress notifications followed by exactly
//! one terminal notification.
//!
//! The concrete peer identity ([`PeerId`], [`AddrInfo`]) and the conversions
//! between it and the generic query types live here as well.

pub mod behaviour;
pub mod conversion;
pub mod events;
pub mod identity;
pub mod notify;

pub use behaviour::PooledQueryBehaviour;
pub use conversion::ConversionError;
pub use events::{BehaviourEvent, WaiterEvent};
pub use identity::{AddrInfo, PeerId};
pub use notify::{Notify, NotifyCloser, NotifyHandle, Waiter};

/// Protocol identifier used for find-closer requests.
pub const PROTOCOL_ID: &str = "/kadmux/kad/1.0.0";

/// Error types for the coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// An event that this behaviour produces was fed back into it.
    #[error("unexpected event for query behaviour: {0}")]
    UnexpectedEvent(&'static str),

    /// The pool refused the query or its configuration.
    #[error("query pool error: {0}")]
    Query(#[from] kadmux_query::QueryError),
}

/// Convenience result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordError>;

//! Async client for the RouterOS API protocol.
//!
//! - **[`proto`]** -- sentence codec: length-prefixed words, request
//!   [`Command`] builder, decoded [`Reply`] sentences.
//! - **[`DeviceClient`]** -- one logged-in TCP session executing commands
//!   sequentially.
//! - **[`ClientPool`]** -- bounded, lazily dialed set of sessions per device
//!   with idle eviction.
//!
//! Knows nothing about WireGuard peers; `wgkeeper-core` builds the peer
//! operations on top of [`ClientPool::run`].

pub mod client;
pub mod error;
pub mod pool;
pub mod proto;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ClientConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_PORT, DeviceClient, Response};
pub use error::Error;
pub use pool::{ClientPool, DEFAULT_CAPACITY, DEFAULT_IDLE_TIMEOUT, PoolConfig, PoolStats, PooledClient};
pub use proto::{Command, Record, Reply};

//! # playground-net
//!
//! The peer fabric of p2p-playground: a secured libp2p host with local and
//! DHT-based discovery, plus the length-prefixed request/reply protocols
//! that the daemon and the controller speak over per-request streams.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod discovery;
pub mod host;
pub mod protocol;

pub use host::{DhtMode, HostConfig, PeerHost, PeerInfo};
pub use libp2p::identity::Keypair;
pub use libp2p::Stream;

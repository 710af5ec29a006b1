//! # playground-daemon
//!
//! The daemon half of p2p-playground: it joins the peer fabric, answers the
//! deploy/list/logs protocols, verifies and unpacks packages, and supervises
//! the applications it deployed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod daemon;
pub mod service;

pub use config::DaemonConfig;
pub use daemon::Daemon;

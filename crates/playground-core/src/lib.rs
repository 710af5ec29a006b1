//! # playground-core
//!
//! Core library for p2p-playground, a peer-to-peer application distribution
//! and supervision fabric.
//!
//! This crate holds everything that does not touch the network: the package
//! format, the signing key store, the application model, health checking and
//! the process supervisor. The peer fabric itself lives in `playground-net`,
//! and the two binaries (`playground-daemon`, `playground-ctl`) wire the
//! pieces together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use playground_core::identity::Signer;
//! use playground_core::package;
//!
//! # fn example() -> playground_core::Result<()> {
//! let archive = package::pack("./my-app".as_ref())?;
//! let signer = Signer::load_or_generate("./keys".as_ref(), "controller")?;
//! let signature = signer.sign_file(&archive)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod error;
pub mod health;
pub mod identity;
pub mod manifest;
pub mod package;
pub mod runtime;

pub use app::{AppStatus, Application};
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use runtime::Runtime;

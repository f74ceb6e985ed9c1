//! Transparent MTProto relay.
//!
//! Accepts obfuscated client streams, strips the camouflage transport,
//! classifies the framed packets, routes them by target DC through a
//! health-aware cluster router, and exchanges them with pooled upstream
//! connections. Liveness is exposed through a plaintext `/stats` endpoint,
//! and an optional supervisor runs several worker processes behind one
//! signal surface.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod supervisor;

pub use error::{ProxyError, Result};

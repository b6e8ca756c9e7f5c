//! A bandwidth-throttling TCP forwarding proxy.
//!
//! `dialup` sits between a client (typically a browser) and one fixed
//! upstream destination, relaying every byte in both directions while
//! capping aggregate throughput at a configured ceiling — a cheap way to
//! find out how an application feels over a slow link without leaving a
//! fast one.

#![deny(unsafe_code)]

mod error;

pub mod handler;
pub mod limiter;
pub mod relay;
pub mod server;
pub mod settings;

pub use error::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Relay Bridge
//!
//! When another router already owns the application-facing address, this
//! instance becomes a relay client of it and forwards its agent's requests.

pub mod client;
pub mod handler;

pub use client::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, RelayClient};
pub use handler::RelayHandler;

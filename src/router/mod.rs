//! Router side: correlation engine and the application listener

pub mod engine;
pub mod listener;

pub use engine::{DEFAULT_CALL_TIMEOUT, DEFAULT_SLOW_CALL_TIMEOUT, PendingInfo, Router, TimeoutPolicy};
pub use listener::{
    AppListener, ConnectionContext, DEFAULT_BIND_ADDRESS, DEFAULT_MAX_CONNECTIONS, ListenerConfig,
    PeerRole, serve_connection,
};

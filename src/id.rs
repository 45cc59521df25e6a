//! ID generation utilities for Toolmux
//!
//! Connection ids are opaque and unique per physical connection for the
//! lifetime of the process. A reconnecting application always gets a new one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Opaque identity of one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new connection ID
    ///
    /// Format: `conn-{timestamp_ms}-{sequence:04}`
    /// Example: `conn-1738300800123-0007`
    pub fn generate() -> Self {
        let seq = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{}-{:04}", now_ms(), seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

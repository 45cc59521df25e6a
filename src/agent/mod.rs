//! Agent-Facing Server - the single protocol endpoint an agent talks to

pub mod handler;
pub mod session;

pub use handler::{DEFAULT_PROTOCOL_VERSION, LocalHandler, RequestHandler, ServerIdentity};
pub use session::{SessionState, SessionSummary, serve_agent};

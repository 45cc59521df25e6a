//! Toolmux - a federating tool router
//!
//! Applications embed a tool host and register their tools with the router;
//! an agent talks to the router alone and sees every connected application's
//! tools under an `app:` namespace. A second router started on the same
//! address relays to the first instead of failing.

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod host;
pub mod id;
pub mod ipc;
pub mod registry;
pub mod relay;
pub mod router;
pub mod service;

pub use error::{Result, RouteError, ToolmuxError};

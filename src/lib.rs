//! termlink - drive an interactive CLI coding agent from your phone
//!
//! The engine runs the agent under a PTY, retains a bounded replay buffer,
//! watches the output stream for "awaiting input" prompts, and serves the
//! whole thing over an authenticated WebSocket.

pub mod auth;
pub mod config;
pub mod error;
pub mod limits;
pub mod notify;
pub mod patterns;
pub mod protocol;
pub mod server;
pub mod session;
pub mod source;
pub mod watcher;

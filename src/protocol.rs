//! WebSocket protocol messages
//!
//! JSON text frames, internally tagged. Raw terminal bytes travel base64
//! encoded so ANSI sequences survive intact.

use crate::patterns::Choice;
use serde::{Deserialize, Serialize};

/// Close reasons sent with forced closures. Unauthenticated parties get no
/// retry guidance beyond "unauthorized".
pub mod close_reason {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const BANNED: &str = "banned";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const TOO_LARGE: &str = "too_large";
}

/// Messages sent from the client to the engine.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection; carries the session credential.
    Hello { token: String },
    /// Start the configured agent command.
    Start {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
    },
    /// Terminal input, base64 encoded.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    /// Request session termination.
    Stop,
    /// Ask for a fresh state snapshot.
    GetState,
    /// Heartbeat ping.
    Ping,
}

/// Messages sent from the engine to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot: sent on admission and on `get_state`.
    State {
        running: bool,
        exit_code: Option<i32>,
        /// Entire retained output buffer, base64 encoded.
        buffer: String,
        trigger: Option<TriggerInfo>,
    },
    /// Raw output chunk, base64 encoded.
    Output { data: String },
    /// The subprocess is waiting on a decision.
    Options {
        prompt: String,
        choices: Vec<Choice>,
    },
    /// The held prompt was answered or went away.
    HideOptions,
    Started {
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
    },
    Exit {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    Error {
        code: String,
        message: String,
    },
    /// Heartbeat pong.
    Pong,
}

/// Wire form of a held trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub prompt: String,
    pub choices: Vec<Choice>,
    pub detected_at: String,
}

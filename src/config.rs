//! Engine configuration
//!
//! All tunables live here with serde defaults, so a partial (or missing)
//! `~/.termlink/config.json` still yields a working engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum bytes of subprocess output retained for late joiners.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Maximum decorated lines kept in the trigger detector's rolling window.
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    /// Per-chunk byte cap applied before ANSI stripping.
    #[serde(default = "default_chunk_cap")]
    pub chunk_cap: usize,
    /// Default PTY geometry used until a client resizes.
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Largest inbound WebSocket message accepted, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Inbound messages allowed per connection within `rate_window_secs`.
    #[serde(default = "default_max_messages_per_window")]
    pub max_messages_per_window: usize,
    /// New connections allowed per source address within `rate_window_secs`.
    #[serde(default = "default_max_connections_per_window")]
    pub max_connections_per_window: usize,
    /// Sliding window length for both rate limits, seconds.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    /// Rate violations tolerated before the connection is closed and banned.
    #[serde(default = "default_violation_limit")]
    pub violation_limit: u32,
    /// Ban duration for abusive source addresses, seconds.
    #[serde(default = "default_ban_secs")]
    pub ban_secs: u64,
    /// Duplicate-notification suppression window, seconds.
    #[serde(default = "default_notify_debounce_secs")]
    pub notify_debounce_secs: u64,
    /// Grace period between SIGTERM and forced kill, seconds.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Optional ntfy-style push topic URL (e.g. https://ntfy.sh/my-topic).
    #[serde(default)]
    pub push_topic_url: Option<String>,
}

fn default_buffer_capacity() -> usize {
    512 * 1024
}
fn default_window_lines() -> usize {
    30
}
fn default_chunk_cap() -> usize {
    64 * 1024
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    30
}
fn default_max_message_bytes() -> usize {
    64 * 1024
}
fn default_max_messages_per_window() -> usize {
    60
}
fn default_max_connections_per_window() -> usize {
    10
}
fn default_rate_window_secs() -> u64 {
    10
}
fn default_violation_limit() -> u32 {
    5
}
fn default_ban_secs() -> u64 {
    300
}
fn default_notify_debounce_secs() -> u64 {
    30
}
fn default_kill_grace_secs() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            window_lines: default_window_lines(),
            chunk_cap: default_chunk_cap(),
            cols: default_cols(),
            rows: default_rows(),
            max_message_bytes: default_max_message_bytes(),
            max_messages_per_window: default_max_messages_per_window(),
            max_connections_per_window: default_max_connections_per_window(),
            rate_window_secs: default_rate_window_secs(),
            violation_limit: default_violation_limit(),
            ban_secs: default_ban_secs(),
            notify_debounce_secs: default_notify_debounce_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            push_topic_url: None,
        }
    }
}

/// Get the termlink config directory (`~/.termlink`).
pub fn config_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".termlink")
}

fn config_file() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from `~/.termlink/config.json`, falling back to
/// defaults when the file is missing or unreadable.
pub fn load_config() -> EngineConfig {
    let path = config_file();
    if !path.exists() {
        return EngineConfig::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                EngineConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config {}: {}", path.display(), e);
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.buffer_capacity, 512 * 1024);
        assert_eq!(config.violation_limit, 5);
        assert!(config.push_topic_url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"buffer_capacity": 1024, "ban_secs": 60}"#).unwrap();
        assert_eq!(config.buffer_capacity, 1024);
        assert_eq!(config.ban_secs, 60);
        assert_eq!(config.window_lines, 30);
    }
}

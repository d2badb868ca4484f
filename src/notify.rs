//! Notification dispatch boundary
//!
//! Receives trigger events from the engine, applies a content + time
//! debounce, and forwards to the delivery channel. `reset_debounce` clears
//! the memory when the operator submits input, so a near-immediate repeat
//! prompt is not suppressed as a duplicate of the one just answered.

use crate::patterns::Choice;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fire-and-forget trigger sink.
pub trait Notifier: Send + Sync {
    fn on_trigger(&self, prompt: &str, choices: &[Choice], fingerprint: u64);
    /// The operator responded; forget the suppression memory.
    fn reset_debounce(&self);
}

/// Discards everything. Used when no push target is configured.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn on_trigger(&self, _prompt: &str, _choices: &[Choice], _fingerprint: u64) {}
    fn reset_debounce(&self) {}
}

/// Debounced push over an ntfy-style topic URL: a plain POST with the prompt
/// as body. Delivery is fire-and-forget; failures are logged and dropped.
pub struct PushNotifier {
    client: reqwest::Client,
    topic_url: String,
    debounce: Duration,
    last: Mutex<Option<(u64, Instant)>>,
}

impl PushNotifier {
    pub fn new(topic_url: impl Into<String>, debounce: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            topic_url: topic_url.into(),
            debounce,
            last: Mutex::new(None),
        }
    }

    /// True when this trigger should go out (and record it as sent).
    fn should_send(&self, fingerprint: u64, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((prev_fp, prev_at)) = *last {
            if prev_fp == fingerprint && now - prev_at < self.debounce {
                return false;
            }
        }
        *last = Some((fingerprint, now));
        true
    }
}

impl Notifier for PushNotifier {
    fn on_trigger(&self, prompt: &str, choices: &[Choice], fingerprint: u64) {
        if !self.should_send(fingerprint, Instant::now()) {
            tracing::debug!("Suppressed duplicate trigger notification");
            return;
        }

        let labels: Vec<&str> = choices.iter().map(|c| c.label.as_str()).collect();
        let body = format!("{}\n[{}]", prompt.trim(), labels.join(" / "));
        let request = self
            .client
            .post(&self.topic_url)
            .header("Title", "Agent is waiting for input")
            .body(body);

        tokio::spawn(async move {
            if let Err(e) = request.send().await {
                tracing::warn!("Push notification failed: {}", e);
            }
        });
    }

    fn reset_debounce(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> PushNotifier {
        PushNotifier::new("http://localhost:1/topic", Duration::from_secs(30))
    }

    #[test]
    fn test_debounce_suppresses_repeat_fingerprint() {
        let n = notifier();
        let now = Instant::now();
        assert!(n.should_send(42, now));
        assert!(!n.should_send(42, now + Duration::from_secs(5)));
    }

    #[test]
    fn test_different_fingerprint_passes() {
        let n = notifier();
        let now = Instant::now();
        assert!(n.should_send(42, now));
        assert!(n.should_send(43, now));
    }

    #[test]
    fn test_debounce_expires() {
        let n = notifier();
        let now = Instant::now();
        assert!(n.should_send(42, now));
        assert!(n.should_send(42, now + Duration::from_secs(31)));
    }

    #[test]
    fn test_reset_unsuppresses() {
        let n = notifier();
        let now = Instant::now();
        assert!(n.should_send(42, now));
        n.reset_debounce();
        assert!(n.should_send(42, now + Duration::from_secs(1)));
    }
}

//! Trigger detection
//!
//! Stateful rolling-window processor over the raw PTY stream. Each chunk is
//! capped, ANSI-stripped, folded into a bounded window of recent non-empty
//! lines, and scanned with the pattern library. A trigger is emitted exactly
//! once per distinct prompt; repeats of the held prompt are suppressed until
//! `reset()` (operator submitted input) or session exit.

use crate::patterns::{Choice, PatternSet};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use strip_ansi_escapes::strip;

/// A detected "awaiting input" state.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub prompt: String,
    pub choices: Vec<Choice>,
    pub fingerprint: u64,
    pub detected_at: DateTime<Utc>,
}

pub struct Watcher {
    patterns: PatternSet,
    window: VecDeque<String>,
    window_lines: usize,
    chunk_cap: usize,
    current: Option<Trigger>,
}

impl Watcher {
    pub fn new(patterns: PatternSet, window_lines: usize, chunk_cap: usize) -> Self {
        Self {
            patterns,
            window: VecDeque::with_capacity(window_lines),
            window_lines,
            chunk_cap,
            current: None,
        }
    }

    /// The trigger currently held, if the subprocess is awaiting input.
    pub fn current(&self) -> Option<&Trigger> {
        self.current.as_ref()
    }

    /// Process one raw output chunk. Returns a trigger only when a prompt is
    /// newly detected (fingerprint differs from the held one).
    pub fn process(&mut self, chunk: &[u8]) -> Option<Trigger> {
        // Cap adversarial chunk sizes before stripping; keep the newest bytes
        // since the prompt, if any, sits at the tail.
        let capped = if chunk.len() > self.chunk_cap {
            &chunk[chunk.len() - self.chunk_cap..]
        } else {
            chunk
        };

        // strip-ansi-escapes runs a VTE parser over the bytes: linear time,
        // no backtracking on pathological sequences.
        let stripped = strip(capped);
        let text = String::from_utf8_lossy(&stripped);

        for line in text.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if self.window.len() == self.window_lines {
                self.window.pop_front();
            }
            self.window.push_back(line.to_string());
        }

        let joined: String = self
            .window
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let (_, choices) = self.patterns.scan(&joined)?;
        let prompt = prompt_text(&joined);
        let fingerprint = fingerprint(&prompt, &choices);

        if self
            .current
            .as_ref()
            .is_some_and(|t| t.fingerprint == fingerprint)
        {
            // Same prompt still on screen - already reported.
            return None;
        }

        let trigger = Trigger {
            prompt,
            choices,
            fingerprint,
            detected_at: Utc::now(),
        };
        self.current = Some(trigger.clone());
        Some(trigger)
    }

    /// Force the detector back to idle. Called when the operator submits a
    /// carriage return (the prompt was answered) and on session exit, so the
    /// next prompt is treated as new even if textually identical.
    pub fn reset(&mut self) {
        self.window.clear();
        self.current = None;
    }
}

/// The prompt shown to the operator: the tail of the window.
fn prompt_text(joined: &str) -> String {
    const MAX_PROMPT_LINES: usize = 8;
    let lines: Vec<&str> = joined.lines().collect();
    let start = lines.len().saturating_sub(MAX_PROMPT_LINES);
    lines[start..].join("\n")
}

/// Cheap, order-sensitive content hash. Collisions only cause a genuinely
/// new but textually-identical prompt to be suppressed, which is accepted.
fn fingerprint(prompt: &str, choices: &[Choice]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prompt.hash(&mut hasher);
    for choice in choices {
        choice.label.hash(&mut hasher);
        choice.send.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher() -> Watcher {
        Watcher::new(PatternSet::with_defaults(), 30, 64 * 1024)
    }

    #[test]
    fn test_detects_yes_no_prompt() {
        let mut w = watcher();
        let trigger = w.process(b"Continue? (y/n) ").unwrap();
        assert_eq!(trigger.choices.len(), 2);
        assert!(trigger.prompt.contains("Continue?"));
        assert!(w.current().is_some());
    }

    #[test]
    fn test_repeat_chunks_emit_once() {
        let mut w = watcher();
        assert!(w.process(b"Continue? (y/n) ").is_some());
        for _ in 0..10 {
            assert!(w.process(b"Continue? (y/n) ").is_none());
        }
    }

    #[test]
    fn test_reset_rearms_identical_prompt() {
        let mut w = watcher();
        assert!(w.process(b"Continue? (y/n) ").is_some());
        w.reset();
        assert!(w.current().is_none());
        assert!(w.process(b"Continue? (y/n) ").is_some());
    }

    #[test]
    fn test_new_prompt_replaces_held_trigger() {
        let mut w = watcher();
        let first = w.process(b"Continue? (y/n) ").unwrap();
        w.reset();
        let second = w.process(b"1. Apply\n2. Skip\n").unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(second.choices[0].label, "1");
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut w = watcher();
        assert!(w.process(b"1. Apply\n").is_none());
        let trigger = w.process(b"2. Skip\n").unwrap();
        assert_eq!(trigger.choices.len(), 2);
    }

    #[test]
    fn test_ansi_decorations_are_stripped() {
        let mut w = watcher();
        let trigger = w
            .process(b"\x1b[1;32mProceed?\x1b[0m \x1b[2m(y/n)\x1b[0m ")
            .unwrap();
        assert!(trigger.prompt.contains("Proceed? (y/n)"));
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut w = Watcher::new(PatternSet::with_defaults(), 30, 1024);
        let mut chunk = vec![b'x'; 8 * 1024];
        chunk.extend_from_slice(b"\nContinue? (y/n) ");
        assert!(w.process(&chunk).is_some());
    }

    #[test]
    fn test_window_evicts_stale_prompt_lines() {
        let mut w = Watcher::new(PatternSet::with_defaults(), 4, 64 * 1024);
        assert!(w.process(b"1. Apply\n2. Skip\n").is_some());
        w.reset();
        // Push the numbered lines out of the window, then feed filler only
        w.process(b"line\nline\nline\nline\nline\n");
        assert!(w.process(b"more filler\n").is_none());
    }
}

//! Prompt pattern library
//!
//! A prioritized set of matchers that turn a window of plain (ANSI-stripped)
//! text into a labeled list of answer choices. Matchers are evaluated
//! highest-priority first; the first one that recognizes the window and
//! extracts enough choices wins outright.

use serde::{Deserialize, Serialize};

/// One answer the operator can pick. `send` is written verbatim to the
/// subprocess (a trailing carriage return is added by the caller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub send: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, send: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            send: send.into(),
        }
    }
}

/// A single prompt matcher: inspects the window text and extracts choices.
/// Returning `None` (or too few choices) passes control to the next matcher.
pub trait PromptMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, window: &str) -> Option<Vec<Choice>>;
}

struct Registered {
    priority: i32,
    seq: usize,
    matcher: Box<dyn PromptMatcher>,
}

/// Ordered collection of matchers. New matchers may be registered at runtime
/// with an explicit priority; higher priorities run first, ties broken by
/// registration order.
pub struct PatternSet {
    matchers: Vec<Registered>,
    next_seq: usize,
}

impl PatternSet {
    pub fn new() -> Self {
        Self {
            matchers: Vec::new(),
            next_seq: 0,
        }
    }

    /// The built-in matcher set, ordered so the more specific forms win over
    /// the generic ones.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(50, Box::new(YesNoAlways));
        set.register(40, Box::new(YesNo));
        set.register(30, Box::new(NumberedList));
        set.register(20, Box::new(LetterMenu));
        set.register(10, Box::new(PressEnter));
        set
    }

    pub fn register(&mut self, priority: i32, matcher: Box<dyn PromptMatcher>) {
        self.matchers.push(Registered {
            priority,
            seq: self.next_seq,
            matcher,
        });
        self.next_seq += 1;
        self.matchers
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    /// Run the window text through the matchers. The winner is the first
    /// matcher producing at least one choice (each matcher enforces its own
    /// minimum internally; e.g. numbered lists require two distinct numbers).
    pub fn scan(&self, window: &str) -> Option<(&'static str, Vec<Choice>)> {
        for entry in &self.matchers {
            if let Some(choices) = entry.matcher.extract(window) {
                if !choices.is_empty() {
                    return Some((entry.matcher.name(), choices));
                }
            }
        }
        None
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------- Built-in matchers ----------

/// `(y/n)`, `[y/n]`, `[Y/n]`, `[y/N]` - case-insensitive binary confirm.
pub struct YesNo;

impl PromptMatcher for YesNo {
    fn name(&self) -> &'static str {
        "yes_no"
    }

    fn extract(&self, window: &str) -> Option<Vec<Choice>> {
        let lower = window.to_lowercase();
        let hit = ["(y/n)", "[y/n]"].iter().any(|p| lower.contains(p));
        if !hit {
            return None;
        }
        Some(vec![Choice::new("Yes", "y"), Choice::new("No", "n")])
    }
}

/// `(y/n/a)` or `(y/n/always)` - confirm with a persist-choice option.
pub struct YesNoAlways;

impl PromptMatcher for YesNoAlways {
    fn name(&self) -> &'static str {
        "yes_no_always"
    }

    fn extract(&self, window: &str) -> Option<Vec<Choice>> {
        let lower = window.to_lowercase();
        let hit = ["(y/n/a)", "(y/n/always)"].iter().any(|p| lower.contains(p));
        if !hit {
            return None;
        }
        Some(vec![
            Choice::new("Yes", "y"),
            Choice::new("No", "n"),
            Choice::new("Always", "a"),
        ])
    }
}

/// Numbered option lists: lines starting with `1. Apply`, `2) Skip`, etc.
/// A line qualifies when a leading integer 1-20 is followed by whitespace
/// (after an optional `.` or `)`) and an uppercase letter. At least two
/// distinct numbers must appear across the window.
pub struct NumberedList;

impl PromptMatcher for NumberedList {
    fn name(&self) -> &'static str {
        "numbered_list"
    }

    fn extract(&self, window: &str) -> Option<Vec<Choice>> {
        let mut numbers: Vec<u32> = Vec::new();
        for line in window.lines() {
            if let Some(n) = leading_option_number(line) {
                if !numbers.contains(&n) {
                    numbers.push(n);
                }
            }
        }
        if numbers.len() < 2 {
            return None;
        }
        numbers.sort_unstable();
        Some(
            numbers
                .into_iter()
                .map(|n| Choice::new(n.to_string(), n.to_string()))
                .collect(),
        )
    }
}

/// Parse `"<n>[./)] <Uppercase...>"` off the front of a line, returning the
/// option number when it is in 1..=20.
fn leading_option_number(line: &str) -> Option<u32> {
    let trimmed = line.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 2 {
        return None;
    }
    let n: u32 = digits.parse().ok()?;
    if !(1..=20).contains(&n) {
        return None;
    }

    let mut rest = trimmed[digits.len()..].chars().peekable();
    // Optional list punctuation directly after the number
    if matches!(rest.peek(), Some('.') | Some(')')) {
        rest.next();
    }
    // Mandatory whitespace, then an uppercase letter
    if !matches!(rest.peek(), Some(c) if c.is_whitespace()) {
        return None;
    }
    while matches!(rest.peek(), Some(c) if c.is_whitespace()) {
        rest.next();
    }
    match rest.next() {
        Some(c) if c.is_uppercase() => Some(n),
        _ => None,
    }
}

/// Single-action prompts: "press enter", "enter to confirm/select".
pub struct PressEnter;

impl PromptMatcher for PressEnter {
    fn name(&self) -> &'static str {
        "press_enter"
    }

    fn extract(&self, window: &str) -> Option<Vec<Choice>> {
        let lower = window.to_lowercase();
        let hit = lower.contains("press enter")
            || lower.contains("enter to confirm")
            || lower.contains("enter to select");
        if !hit {
            return None;
        }
        Some(vec![Choice::new("OK", "")])
    }
}

/// Parenthesized-letter menus: every `(a)pply`-style occurrence becomes a
/// choice; requires at least two occurrences in the window.
pub struct LetterMenu;

impl PromptMatcher for LetterMenu {
    fn name(&self) -> &'static str {
        "letter_menu"
    }

    fn extract(&self, window: &str) -> Option<Vec<Choice>> {
        let chars: Vec<char> = window.chars().collect();
        let mut choices: Vec<Choice> = Vec::new();

        let mut i = 0;
        while i + 2 < chars.len() {
            if chars[i] == '('
                && chars[i + 1].is_ascii_alphabetic()
                && chars[i + 2] == ')'
            {
                let letter = chars[i + 1].to_ascii_lowercase();
                // Word following the closing paren, e.g. "pply" in "(a)pply"
                let mut word = String::new();
                let mut j = i + 3;
                while j < chars.len() && chars[j].is_alphanumeric() {
                    word.push(chars[j]);
                    j += 1;
                }
                if !word.is_empty() {
                    let label = format!("{}{}", letter.to_ascii_uppercase(), word);
                    let send = letter.to_string();
                    if !choices.iter().any(|c: &Choice| c.send == send) {
                        choices.push(Choice { label, send });
                    }
                    i = j;
                    continue;
                }
            }
            i += 1;
        }

        if choices.len() < 2 {
            return None;
        }
        Some(choices)
    }
}

//! Output Classifier: one raw agent line in, one typed line out.
//!
//! Every line is first tried as a structured [`AgentEvent`]. Only lines
//! that are not valid events fall back to marker matching, which exists
//! for agents that print plain text. The same fallback also recognizes the
//! iteration boundaries such agents announce ([`TextMarker`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::AgentEvent;

/// Kind of a line shown in the live output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[serde(alias = "info")]
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    Error,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
        }
    }
}

/// A classified output line. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub kind: OutputKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// The line was a well-formed structured event.
    Structured(AgentEvent),
    /// The line was plain text, or a malformed event.
    Heuristic(OutputLine),
}

impl Classified {
    /// The line as shown to live observers.
    pub fn output_line(&self) -> OutputLine {
        match self {
            Self::Heuristic(line) => line.clone(),
            Self::Structured(AgentEvent::Output { kind, content }) => {
                OutputLine::new(*kind, content.clone())
            }
            Self::Structured(event @ AgentEvent::Error { .. }) => {
                OutputLine::new(OutputKind::Error, event.summary())
            }
            Self::Structured(event) => OutputLine::new(OutputKind::Text, event.summary()),
        }
    }

    pub fn event(&self) -> Option<&AgentEvent> {
        match self {
            Self::Structured(event) => Some(event),
            Self::Heuristic(_) => None,
        }
    }

    /// Iteration boundary announced by a plain-text line.
    pub fn text_marker(&self) -> Option<TextMarker> {
        match self {
            Self::Heuristic(line) => text_marker(&line.content),
            Self::Structured(_) => None,
        }
    }

    /// Performer named by a plain-text line.
    pub fn text_performer(&self) -> Option<String> {
        match self {
            Self::Heuristic(line) => text_performer(&line.content),
            Self::Structured(_) => None,
        }
    }
}

/// Classify one raw line from the agent.
pub fn classify(line: &str) -> Classified {
    let line = line.trim_end_matches(['\r', '\n']);
    match AgentEvent::parse(line) {
        Some(event) => Classified::Structured(event),
        None => Classified::Heuristic(OutputLine::new(heuristic_kind(line), line)),
    }
}

const TOOL_MARKERS: [&str; 8] = [
    "tool:",
    "using tool",
    "bash:",
    "read:",
    "write:",
    "edit:",
    "grep:",
    "glob:",
];

const ERROR_WORDS: [&str; 3] = ["error", "fatal", "failed"];

/// Marker-based kind for plain-text lines. First match wins, checked in
/// the order error, thinking, tool use, tool result.
pub fn heuristic_kind(line: &str) -> OutputKind {
    let trimmed = line.trim_start();
    let lower = trimmed.to_lowercase();

    if trimmed.starts_with("Error:")
        || trimmed.starts_with("ERROR:")
        || trimmed.contains('✗')
        || lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| ERROR_WORDS.contains(&word))
    {
        return OutputKind::Error;
    }

    if lower.contains("thinking") || trimmed.starts_with('>') {
        return OutputKind::Thinking;
    }

    if TOOL_MARKERS.iter().any(|m| lower.contains(m)) {
        return OutputKind::ToolUse;
    }

    if lower.starts_with("result:") || lower.starts_with("output:") || trimmed.starts_with('✓') {
        return OutputKind::ToolResult;
    }

    OutputKind::Text
}

/// Iteration boundary recognized in plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMarker {
    /// `iteration N`, e.g. "Starting iteration 3".
    Start(u32),
    RateLimited,
    NoProgress,
    Error,
    Complete,
}

/// Boundary announced by a plain-text line. A start wins over a close on
/// the same line; closes are checked in the order rate limit, no progress,
/// error, completion.
pub fn text_marker(line: &str) -> Option<TextMarker> {
    if let Some(iteration) = iteration_number(line) {
        return Some(TextMarker::Start(iteration));
    }

    let lower = line.trim().to_lowercase();
    if lower.contains("rate limit") {
        Some(TextMarker::RateLimited)
    } else if lower.contains("no progress") {
        Some(TextMarker::NoProgress)
    } else if lower.starts_with("error:") || lower.contains("fatal error") {
        Some(TextMarker::Error)
    } else if lower.contains("iteration complete") || lower.contains("completed successfully") {
        Some(TextMarker::Complete)
    } else {
        None
    }
}

/// The number following the word "iteration", if it is one.
fn iteration_number(line: &str) -> Option<u32> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("iteration") {
            let next = words.next()?.trim_end_matches(['.', ':', ',']);
            if !next.is_empty() && next.bytes().all(|b| b.is_ascii_digit()) {
                return next.parse().ok();
            }
        }
    }
    None
}

/// Performer from lines like "performer: cleanup" or "Running performer task".
pub fn text_performer(line: &str) -> Option<String> {
    let lower = line.to_lowercase();
    if !lower.contains("performer:") && !lower.contains("running performer") {
        return None;
    }
    // Lowercasing can shift byte offsets for non-ASCII text.
    if lower.len() != line.len() {
        return None;
    }
    let at = lower.find("performer")? + "performer".len();
    let name = line
        .get(at..)?
        .trim_start()
        .trim_start_matches(':')
        .split_whitespace()
        .next()?;
    (!name.starts_with('(')).then(|| name.to_string())
}

//! Valence Scorer.
//!
//! Maps episode text (plus an optional task hint) to a [`ValenceScore`] with a
//! fixed, deterministic keyword heuristic.  No randomness and no I/O: the same
//! `(text, hint)` pair always yields a bit-identical score.
//!
//! ## Model
//!
//! Text is lower-cased and split on every non-alphanumeric character.
//!
//! * **Polarity** – every token found in the positive or negative keyword
//!   table contributes its weight (negative for the negative table).  A base
//!   lexical estimate, the net keyword balance divided by the token count, is
//!   added on top.  The raw sum is saturated with `tanh`, so the result stays
//!   within `[-1, 1]` however many keywords match.
//! * **Goal relevance** – the task hint (normalised to `snake_case`) and the
//!   task keywords found in the text are looked up in a task-type → weight
//!   table.  The maximum matching weight wins; weights are never summed.
//!   Nothing matching gives `0.0`.
//! * **Arousal** – `0.5 · |polarity|`, plus [`INTENSITY_INCREMENT`] per
//!   intensity keyword occurrence, plus [`GOAL_AROUSAL_BONUS`] when goal
//!   relevance exceeds [`GOAL_AROUSAL_THRESHOLD`], clamped to `[0, 1]`.
//!
//! # Example
//!
//! ```rust
//! use cogmem_memory::valence::{LexiconScorer, ValenceScorer};
//!
//! let scorer = LexiconScorer::new();
//! let v = scorer.score("urgent client complaint", Some("client_complaint")).unwrap();
//! assert!(v.polarity < 0.0);
//! assert!(v.goal_relevance > 0.7);
//! assert!(v.arousal > 0.5);
//! ```

use cogmem_types::ValenceScore;
use thiserror::Error;

/// Errors a [`ValenceScorer`] implementation may report.
///
/// Callers on the write path degrade to [`ValenceScore::neutral`] instead of
/// failing.
#[derive(Error, Debug)]
pub enum ValenceError {
    #[error("Scorer produced a non-finite value for {0}")]
    NonFinite(&'static str),
    #[error("Scorer unavailable: {0}")]
    Unavailable(String),
}

/// Pluggable salience heuristic.
pub trait ValenceScorer: Send + Sync {
    fn score(&self, text: &str, task_hint: Option<&str>) -> Result<ValenceScore, ValenceError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyword tables
// ─────────────────────────────────────────────────────────────────────────────

const POSITIVE: &[(&str, f64)] = &[
    ("success", 0.6),
    ("successful", 0.6),
    ("excellent", 0.7),
    ("great", 0.5),
    ("good", 0.3),
    ("happy", 0.5),
    ("love", 0.6),
    ("thanks", 0.3),
    ("thank", 0.3),
    ("resolved", 0.5),
    ("fixed", 0.4),
    ("completed", 0.4),
    ("win", 0.5),
    ("praise", 0.5),
    ("satisfied", 0.5),
];

const NEGATIVE: &[(&str, f64)] = &[
    ("complaint", 0.6),
    ("complain", 0.5),
    ("angry", 0.7),
    ("frustrated", 0.6),
    ("bad", 0.3),
    ("terrible", 0.7),
    ("error", 0.4),
    ("failure", 0.6),
    ("failed", 0.5),
    ("broken", 0.5),
    ("bug", 0.4),
    ("crash", 0.6),
    ("outage", 0.7),
    ("problem", 0.4),
    ("refund", 0.4),
    ("late", 0.3),
];

const INTENSITY: &[&str] = &[
    "urgent",
    "urgently",
    "critical",
    "emergency",
    "asap",
    "immediately",
    "severe",
];

/// Task type → (goal relevance weight, text keywords that imply the task).
const TASKS: &[(&str, f64, &[&str])] = &[
    ("client_complaint", 0.9, &["complaint", "complain", "refund"]),
    ("incident", 0.85, &["outage", "crash", "incident"]),
    ("deadline", 0.8, &["deadline", "due"]),
    ("bug_report", 0.75, &["bug", "error", "broken"]),
    ("feature_request", 0.6, &["feature", "request"]),
    ("meeting", 0.5, &["meeting", "agenda"]),
    ("planning", 0.5, &["plan", "roadmap"]),
    ("small_talk", 0.1, &["weather", "weekend"]),
];

/// Added to arousal for every intensity keyword occurrence.
pub const INTENSITY_INCREMENT: f64 = 0.15;
/// Added to arousal when goal relevance exceeds [`GOAL_AROUSAL_THRESHOLD`].
pub const GOAL_AROUSAL_BONUS: f64 = 0.2;
pub const GOAL_AROUSAL_THRESHOLD: f64 = 0.7;

fn lookup(table: &[(&str, f64)], token: &str) -> Option<f64> {
    table.iter().find(|(word, _)| *word == token).map(|(_, w)| *w)
}

fn normalise_hint(hint: &str) -> String {
    hint.trim()
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

// ─────────────────────────────────────────────────────────────────────────────
// LexiconScorer
// ─────────────────────────────────────────────────────────────────────────────

/// The default keyword-table scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconScorer;

impl LexiconScorer {
    pub fn new() -> Self {
        Self
    }

    fn polarity(tokens: &[String]) -> f64 {
        if tokens.is_empty() {
            return 0.0;
        }
        let mut weighted = 0.0;
        let mut balance = 0i64;
        for token in tokens {
            if let Some(w) = lookup(POSITIVE, token) {
                weighted += w;
                balance += 1;
            }
            if let Some(w) = lookup(NEGATIVE, token) {
                weighted -= w;
                balance -= 1;
            }
        }
        let lexical = balance as f64 / tokens.len() as f64;
        (weighted + lexical).tanh()
    }

    fn goal_relevance(tokens: &[String], task_hint: Option<&str>) -> f64 {
        let hint = task_hint.map(normalise_hint);
        TASKS
            .iter()
            .filter(|(task, _, keywords)| {
                hint.as_deref() == Some(*task)
                    || tokens.iter().any(|t| keywords.contains(&t.as_str()))
            })
            .map(|(_, weight, _)| *weight)
            .fold(0.0, f64::max)
    }

    fn arousal(tokens: &[String], polarity: f64, goal_relevance: f64) -> f64 {
        let intensity = tokens
            .iter()
            .filter(|t| INTENSITY.contains(&t.as_str()))
            .count() as f64;
        let mut arousal = 0.5 * polarity.abs() + INTENSITY_INCREMENT * intensity;
        if goal_relevance > GOAL_AROUSAL_THRESHOLD {
            arousal += GOAL_AROUSAL_BONUS;
        }
        arousal.clamp(0.0, 1.0)
    }
}

/// Lower-case alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl ValenceScorer for LexiconScorer {
    fn score(&self, text: &str, task_hint: Option<&str>) -> Result<ValenceScore, ValenceError> {
        let tokens = tokenize(text);
        let polarity = Self::polarity(&tokens);
        if !polarity.is_finite() {
            return Err(ValenceError::NonFinite("polarity"));
        }
        let goal_relevance = Self::goal_relevance(&tokens, task_hint);
        let arousal = Self::arousal(&tokens, polarity, goal_relevance);
        Ok(ValenceScore::new(polarity, goal_relevance, arousal))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

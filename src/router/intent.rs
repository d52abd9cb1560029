//! Lexical classification of a question before any backend is touched.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Help,
    /// "does X exist" / "is there a column Y in X"
    Existence {
        subject: String,
        column: Option<String>,
    },
    Data {
        chart: Option<ChartKind>,
    },
}

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "greetings",
    "good morning",
    "good afternoon",
    "good evening",
    "thanks",
    "thank you",
];

const HELP_PHRASES: &[&str] = &["help", "what can you do", "how does this work"];

/// Words that mark a question as a data request even when it starts like a
/// greeting ("hi, count the users").
const DATA_KEYWORDS: &[&str] = &[
    "select", "count", "where", "show", "list", "find", "how many", "average", "sum", "total",
];

const CHART_KEYWORDS: &[&str] = &["chart", "plot", "graph", "visualize", "visualise", "trend", "distribution"];
const LINE_KEYWORDS: &[&str] = &["trend", "over time", "line"];
const PIE_KEYWORDS: &[&str] = &["share", "percentage", "breakdown", "proportion", "pie"];

fn existence_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // column questions first; (column, subject) order is fixed below
            r"^is there an? (?:column|field) (?:named |called )?(?P<column>[\w.]+) in (?:the )?(?P<subject>[\w.]+)(?: table| collection)?$",
            r"^does (?:the )?(?P<subject>[\w.]+)(?: table| collection)? have (?:an? )?(?:column|field) (?:named |called )?(?P<column>[\w.]+)$",
            r"^is there an? (?:table|collection) (?:named |called )?(?P<subject>[\w.]+)$",
            r"^does (?:an? |the )?(?:table |collection )?(?P<subject>[\w.]+)(?: table| collection)? exists?$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static existence regex"))
        .collect()
    })
}

/// Lowercase, collapse whitespace and drop trailing punctuation.
fn normalize(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(|c: char| matches!(c, '!' | '.' | '?' | ',' | ';'))
        .trim()
        .to_string()
}

fn contains_word(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + phrase.len()..].chars().next();
        let edge = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
        edge(before) && edge(after)
    })
}

fn has_data_keyword(text: &str) -> bool {
    DATA_KEYWORDS.iter().any(|kw| contains_word(text, kw))
}

fn phrase_match(text: &str, phrases: &[&str]) -> bool {
    let text = text.strip_suffix(" there").unwrap_or(text);
    let text = text.trim_end_matches(|c: char| c == ',' || c == '!').trim();
    phrases.contains(&text)
}

pub fn chart_kind(text: &str) -> Option<ChartKind> {
    if !CHART_KEYWORDS.iter().any(|kw| contains_word(text, kw)) {
        return None;
    }
    if LINE_KEYWORDS.iter().any(|kw| contains_word(text, kw)) {
        Some(ChartKind::Line)
    } else if PIE_KEYWORDS.iter().any(|kw| contains_word(text, kw)) {
        Some(ChartKind::Pie)
    } else {
        Some(ChartKind::Bar)
    }
}

pub fn classify(question: &str) -> Intent {
    let text = normalize(question);

    if !has_data_keyword(&text) {
        if phrase_match(&text, GREETINGS) {
            return Intent::Greeting;
        }
        if phrase_match(&text, HELP_PHRASES) {
            return Intent::Help;
        }
    }

    for pattern in existence_patterns() {
        if let Some(caps) = pattern.captures(&text) {
            if let Some(subject) = caps.name("subject") {
                return Intent::Existence {
                    subject: subject.as_str().to_string(),
                    column: caps.name("column").map(|c| c.as_str().to_string()),
                };
            }
        }
    }

    Intent::Data {
        chart: chart_kind(&text),
    }
}

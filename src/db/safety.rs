//! Read-only guard for generated SQL.
//!
//! Query text reaching this module comes from a language model, so it is
//! treated as untrusted. Only a single `SELECT` statement without any
//! mutating keyword, comment marker or bare `UNION` gets through.

use regex::Regex;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use std::fmt;
use std::sync::OnceLock;

/// Keywords that may never appear anywhere in a generated query.
pub const DISALLOWED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "RENAME", "GRANT",
    "REVOKE", "EXEC", "EXECUTE",
];

/// Why a query was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    NotSelect { found: String },
    DisallowedKeyword(String),
    Union,
    CommentMarker,
    SelectInto,
    MultipleStatements(usize),
    Unparseable(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Empty => write!(f, "No SQL statement found"),
            Rejection::NotSelect { found } => {
                write!(f, "Only SELECT statements are allowed (found '{}')", found)
            }
            Rejection::DisallowedKeyword(kw) => {
                write!(f, "Disallowed SQL keyword '{}' found in query", kw)
            }
            Rejection::Union => write!(
                f,
                "Disallowed SQL keyword 'UNION' found in query; only UNION DISTINCT is allowed"
            ),
            Rejection::CommentMarker => write!(f, "SQL comments ('--') are not allowed"),
            Rejection::SelectInto => write!(f, "SELECT ... INTO is not allowed"),
            Rejection::MultipleStatements(n) => write!(
                f,
                "Only one SQL statement per request is allowed (found {})",
                n
            ),
            Rejection::Unparseable(e) => write!(f, "Query could not be parsed: {}", e),
        }
    }
}

impl std::error::Error for Rejection {}

fn keyword_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let alternation = DISALLOWED_KEYWORDS.join("|");
        Regex::new(&format!(r"(?i)\b({})\b", alternation)).expect("static keyword regex")
    })
}

fn union_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bUNION\b(?:\s+(\w+))?").expect("static union regex"))
}

/// Remove a Markdown code fence (```` ```sql ... ``` ````) around a query.
///
/// Text without a fence is returned trimmed.
pub fn strip_fence(text: &str) -> String {
    let text = text.trim();
    let Some(body) = text.strip_prefix("```") else {
        return text.to_string();
    };

    let body = match body.split_once('\n') {
        // First line is the language tag (possibly empty)
        Some((tag, rest)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => rest,
        Some(_) => body,
        None => {
            // Single-line fence: ```sql SELECT 1```
            let trimmed = body.trim_start();
            match trimmed.get(..3) {
                Some(tag) if tag.eq_ignore_ascii_case("sql") => &trimmed[3..],
                _ => trimmed,
            }
        }
    };

    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Skip whitespace and `/* ... */` block comments at the start of a query.
fn skip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    while let Some(after) = rest.strip_prefix("/*") {
        match after.find("*/") {
            Some(end) => rest = after[end + 2..].trim_start(),
            None => return "",
        }
    }
    rest
}

fn first_word(sql: &str) -> &str {
    let end = sql
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(sql.len());
    if end == 0 {
        sql.get(..1).unwrap_or("")
    } else {
        &sql[..end]
    }
}

/// Check a single statement of query text. The text must already be free of
/// Markdown fences (see [`strip_fence`]).
pub fn validate(sql: &str) -> Result<(), Rejection> {
    if sql.trim().is_empty() {
        return Err(Rejection::Empty);
    }

    if sql.contains("--") {
        return Err(Rejection::CommentMarker);
    }

    let body = skip_leading_comments(sql);
    let word = first_word(body);
    if !word.eq_ignore_ascii_case("SELECT") {
        return Err(Rejection::NotSelect {
            found: if word.is_empty() {
                "N/A".to_string()
            } else {
                word.to_string()
            },
        });
    }

    if let Some(m) = keyword_pattern().find(sql) {
        return Err(Rejection::DisallowedKeyword(m.as_str().to_uppercase()));
    }

    for caps in union_pattern().captures_iter(sql) {
        let quantifier = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if !quantifier.eq_ignore_ascii_case("DISTINCT") {
            return Err(Rejection::Union);
        }
    }

    let statements = SqlParser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| Rejection::Unparseable(e.to_string()))?;
    if statements.len() != 1 {
        return Err(Rejection::MultipleStatements(statements.len()));
    }

    match &statements[0] {
        Statement::Query(query) => {
            if let SetExpr::Select(select) = query.body.as_ref() {
                if select.into.is_some() {
                    return Err(Rejection::SelectInto);
                }
            }
            Ok(())
        }
        other => Err(Rejection::NotSelect {
            found: first_word(&other.to_string()).to_string(),
        }),
    }
}

/// Strip fences and validate in one step, returning the executable text.
pub fn sanitize(raw: &str) -> Result<String, Rejection> {
    let sql = strip_fence(raw);
    validate(&sql)?;
    Ok(sql)
}

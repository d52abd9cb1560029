//! Natural-language to query generation.
//!
//! Generators never fail with an `Err`: every outcome, including a refused
//! or unparseable reply, is a variant the router can branch on.

mod cached;
mod gemini;
mod heuristic;

pub use cached::CachedGenerator;
pub use gemini::{GeminiConfig, GeminiGenerator};
pub use heuristic::HeuristicDocumentGenerator;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::safety::strip_fence;
use crate::document::DocumentQuery;
use crate::schema::SchemaSnapshot;

/// Generated relational query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlGeneration {
    /// One statement for the default engine.
    Single(String),
    /// engine name -> statement
    PerEngine(BTreeMap<String, String>),
    Failed(String),
}

/// Generated document query.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentGeneration {
    Query(DocumentQuery),
    /// The generator had nothing to offer.
    Empty,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("No API key configured (set GEMINI_API_KEY)")]
    MissingApiKey,
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("LLM returned no text")]
    EmptyReply,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, schema: &SchemaSnapshot) -> SqlGeneration;
}

#[async_trait]
pub trait DocumentQueryGenerator: Send + Sync {
    async fn generate_document_query(&self, question: &str, schema: &SchemaSnapshot) -> DocumentGeneration;
}

const REFUSAL_PREFIXES: &[&str] = &["error", "i cannot", "i can't", "i'm sorry", "sorry"];

fn refusal(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    REFUSAL_PREFIXES
        .iter()
        .any(|p| lower.starts_with(p))
        .then(|| {
            text.split_once(':')
                .filter(|(head, _)| head.eq_ignore_ascii_case("error"))
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_else(|| text.to_string())
        })
}

fn error_field(map: &serde_json::Map<String, Value>) -> Option<String> {
    map.get("error").map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Interpret a model reply as SQL: a JSON object maps engines to
/// statements, anything else is one statement.
pub fn parse_sql_reply(reply: &str) -> SqlGeneration {
    let text = strip_fence(reply);
    if text.is_empty() {
        return SqlGeneration::Failed("The generator returned an empty reply".to_string());
    }
    if let Some(reason) = refusal(&text) {
        return SqlGeneration::Failed(reason);
    }

    if text.starts_with('{') {
        let map = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return SqlGeneration::Failed("The generator returned malformed JSON".to_string())
            }
        };
        if let Some(reason) = error_field(&map) {
            return SqlGeneration::Failed(reason);
        }
        let queries: BTreeMap<String, String> = map
            .into_iter()
            .filter_map(|(engine, sql)| match sql {
                Value::String(sql) if !sql.trim().is_empty() => Some((engine, strip_fence(&sql))),
                _ => None,
            })
            .collect();
        if queries.is_empty() {
            return SqlGeneration::Failed("The generator returned no queries".to_string());
        }
        return SqlGeneration::PerEngine(queries);
    }

    SqlGeneration::Single(text)
}

/// Interpret a model reply as a document query object.
pub fn parse_document_reply(reply: &str) -> DocumentGeneration {
    let text = strip_fence(reply);
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text == "{}" {
        return DocumentGeneration::Empty;
    }
    if let Some(reason) = refusal(&text) {
        return DocumentGeneration::Failed(reason);
    }

    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(e) => return DocumentGeneration::Failed(format!("Malformed document query: {}", e)),
    };
    if let Some(reason) = value.as_object().and_then(error_field) {
        return DocumentGeneration::Failed(reason);
    }
    match serde_json::from_value::<DocumentQuery>(value) {
        Ok(query) if query.collection_name.trim().is_empty() => DocumentGeneration::Empty,
        Ok(query) => DocumentGeneration::Query(query),
        Err(e) => DocumentGeneration::Failed(format!("Malformed document query: {}", e)),
    }
}

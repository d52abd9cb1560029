use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::intent::ChartKind;
use crate::db::Row;
use crate::schema::SchemaSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Greeting,
    Existence,
    Data,
    NoData,
    SecurityRefusal,
    Failure,
    ServerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Relational,
    Document,
    None,
}

/// Source tag used when rows were found by broadcasting over databases.
pub const MULTIPLE_SOURCES: &str = "multiple";

pub fn single_source(name: &str) -> String {
    format!("single:{}", name)
}

/// Everything the caller gets back for one question.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    pub kind: ResponseKind,
    pub success: bool,
    pub answer: String,
    pub rows: Vec<Row>,
    pub backend: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub per_source: BTreeMap<String, Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_name_used: Option<String>,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartKind>,
    /// Generated query text, only when exposure is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl RouteResponse {
    pub fn new(kind: ResponseKind, answer: impl Into<String>) -> Self {
        Self {
            kind,
            success: matches!(
                kind,
                ResponseKind::Greeting | ResponseKind::Existence | ResponseKind::Data
            ),
            answer: answer.into(),
            rows: Vec::new(),
            backend: Backend::None,
            source: None,
            per_source: BTreeMap::new(),
            db_name_used: None,
            suggestions: Vec::new(),
            error: None,
            chart: None,
            query: None,
        }
    }

    /// Rows found on one backend.
    pub fn data(backend: Backend, rows: Vec<Row>, source: String) -> Self {
        let mut response = Self::new(ResponseKind::Data, summarize(&rows));
        response.backend = backend;
        response.rows = rows;
        response.source = Some(source);
        response
    }

    pub fn server_error() -> Self {
        let mut response = Self::new(
            ResponseKind::ServerError,
            "An unexpected internal error occurred while answering your question.",
        );
        response.error = Some("internal error".to_string());
        response.suggestions = rephrasing_tips();
        response
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn readable_column(name: &str) -> String {
    name.replace('_', " ")
        .replace(['(', ')'], "")
        .trim()
        .to_lowercase()
}

/// One-line natural language summary of a result set.
pub fn summarize(rows: &[Row]) -> String {
    if rows.is_empty() {
        return "I couldn't find any data matching your request.".to_string();
    }
    if let [row] = rows {
        if let (1, Some((column, value))) = (row.len(), row.iter().next()) {
            return format!("The {} is: {}.", readable_column(column), display_value(value));
        }
    }
    format!(
        "Here are the results from your query. Found {} record(s).",
        rows.len()
    )
}

/// Example questions built from the schema.
pub fn schema_suggestions(schema: &SchemaSnapshot, max: usize) -> Vec<String> {
    let mut suggestions = Vec::new();
    for table in schema.merged_tables().keys() {
        suggestions.push(format!("Show me all {}", table));
        suggestions.push(format!("How many {} are there?", table));
    }
    for (database, collections) in &schema.document {
        for collection in collections.keys() {
            suggestions.push(format!("Find {} in {}", collection, database));
        }
    }
    suggestions.dedup();
    suggestions.truncate(max);
    suggestions
}

pub fn rephrasing_tips() -> Vec<String> {
    vec![
        "Try rephrasing your question using table or collection names".to_string(),
        "Mention the column or field you are interested in".to_string(),
        "Ask about one table or collection at a time".to_string(),
    ]
}

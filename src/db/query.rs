use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::types::Type;

use super::safety::{sanitize, Rejection};

/// One materialized result row: column name -> JSON value, in column order.
pub type Row = serde_json::Map<String, Value>;

/// Table name -> column names.
pub type TableMap = BTreeMap<String, Vec<String>>;

/// Categorized error types for SQL query failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, permission denied)
    Execution,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Failure of one statement against one engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{category}: {message}")]
pub struct ExecError {
    pub category: ErrorCategory,
    /// SQLSTATE error code (e.g., "42601" for syntax_error)
    pub code: Option<String>,
    pub message: String,
}

impl ExecError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: None,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    pub fn from_pg_error(err: &tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            Self {
                category: categorize_sqlstate(&code),
                code: Some(code),
                message: db_err.message().to_string(),
            }
        } else {
            // Non-database error (connection, protocol, etc.)
            let category = if err.source().is_some() || err.is_closed() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            Self::new(category, err.to_string())
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else if code == "42501" {
                // insufficient_privilege
                ErrorCategory::Execution
            } else {
                ErrorCategory::Semantic
            }
        }
        "22" | "23" | "25" | "40" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "08" | "28" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Access to the registered relational engines.
///
/// Implementations must lease a connection per call and release it before
/// returning; no cursor may outlive the call.
#[async_trait]
pub trait RelationalBackend: Send + Sync {
    /// Names of all registered engines, sorted.
    fn engine_names(&self) -> Vec<String>;

    /// Engine used for single-statement queries.
    fn default_engine(&self) -> Option<String>;

    /// Run an already validated statement and materialize all rows.
    async fn run(&self, engine: &str, sql: &str) -> Result<Vec<Row>, ExecError>;

    /// Tables and their columns for one engine.
    async fn tables(&self, engine: &str) -> Result<TableMap, ExecError>;
}

/// Result of running one generated statement against one engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    Rows(Vec<Row>),
    Failed(ExecError),
    Rejected(Rejection),
}

impl EngineOutcome {
    pub fn rows(&self) -> &[Row] {
        match self {
            EngineOutcome::Rows(rows) => rows,
            _ => &[],
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            EngineOutcome::Rows(_) => None,
            EngineOutcome::Failed(e) => Some(e.to_string()),
            EngineOutcome::Rejected(r) => Some(format!("Security check failed: {}", r)),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, EngineOutcome::Rejected(_))
    }
}

/// Runs generated SQL against the engine registry. Every statement passes
/// the safety validator first.
#[derive(Clone)]
pub struct RelationalExecutor {
    backend: Arc<dyn RelationalBackend>,
}

impl RelationalExecutor {
    pub fn new(backend: Arc<dyn RelationalBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn RelationalBackend> {
        &self.backend
    }

    /// Single-engine path: run against the default engine.
    pub async fn execute_one(&self, sql: &str) -> (String, EngineOutcome) {
        match self.backend.default_engine() {
            Some(engine) => {
                let outcome = self.execute_on(&engine, sql).await;
                (engine, outcome)
            }
            None => (
                String::new(),
                EngineOutcome::Failed(ExecError::connection("No relational engine is configured")),
            ),
        }
    }

    /// Multi-engine path. Engines missing from the registry are skipped;
    /// a failure on one engine never stops the others.
    pub async fn execute(&self, queries: &BTreeMap<String, String>) -> BTreeMap<String, EngineOutcome> {
        let known = self.backend.engine_names();
        let mut outcomes = BTreeMap::new();

        for (engine, sql) in queries {
            if !known.iter().any(|k| k == engine) {
                tracing::debug!(engine = %engine, "skipping query for unregistered engine");
                continue;
            }
            let outcome = self.execute_on(engine, sql).await;
            outcomes.insert(engine.clone(), outcome);
        }

        outcomes
    }

    async fn execute_on(&self, engine: &str, raw_sql: &str) -> EngineOutcome {
        let sql = match sanitize(raw_sql) {
            Ok(sql) => sql,
            Err(rejection) => {
                tracing::warn!(engine, query = raw_sql, %rejection, "generated SQL rejected");
                return EngineOutcome::Rejected(rejection);
            }
        };

        let start = Instant::now();
        match self.backend.run(engine, &sql).await {
            Ok(rows) => {
                tracing::info!(
                    engine,
                    rows = rows.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "relational query executed"
                );
                EngineOutcome::Rows(rows)
            }
            Err(e) => {
                tracing::error!(engine, query = %sql, error = %e, "relational query failed");
                EngineOutcome::Failed(e)
            }
        }
    }
}

/// Union of all rows plus the per-engine subsets that contributed rows.
pub fn merge_rows(outcomes: &BTreeMap<String, EngineOutcome>) -> (Vec<Row>, BTreeMap<String, Vec<Row>>) {
    let mut merged = Vec::new();
    let mut contributing = BTreeMap::new();
    for (engine, outcome) in outcomes {
        let rows = outcome.rows();
        if rows.is_empty() {
            continue;
        }
        merged.extend(rows.iter().cloned());
        contributing.insert(engine.clone(), rows.to_vec());
    }
    (merged, contributing)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
}

impl CellValue {
    pub fn into_json(self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(b),
            CellValue::Int16(i) => serde_json::json!(i),
            CellValue::Int32(i) => serde_json::json!(i),
            CellValue::Int64(i) => serde_json::json!(i),
            CellValue::Float32(f) => serde_json::json!(f),
            CellValue::Float64(f) => serde_json::json!(f),
            CellValue::Numeric(d) => match d.to_f64() {
                Some(f) => serde_json::json!(f),
                None => Value::String(d.to_string()),
            },
            CellValue::Text(s) => Value::String(s),
            CellValue::Bytes(b) => Value::String(format!("[{} bytes]", b.len())),
            CellValue::Date(d) => Value::String(d.to_string()),
            CellValue::Time(t) => Value::String(t.to_string()),
            CellValue::DateTime(dt) => Value::String(dt.to_string()),
            CellValue::TimestampTz(dt) => Value::String(dt.to_rfc3339()),
            CellValue::Json(j) => j,
        }
    }
}

/// Materialize driver rows into column-name keyed maps.
pub fn rows_to_maps(rows: &[tokio_postgres::Row]) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            let mut map = Row::new();
            for (i, col) in row.columns().iter().enumerate() {
                let value = extract_value(row, i, col.type_()).into_json();
                map.insert(col.name().to_string(), value);
            }
            map
        })
        .collect()
}

fn extract_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int16)
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int32)
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int64)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float32)
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float64)
            .unwrap_or(CellValue::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Numeric)
            .unwrap_or(CellValue::Null),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
    }
}

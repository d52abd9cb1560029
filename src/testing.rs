//! In-memory doubles for the backend and generator seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::db::{ExecError, RelationalBackend, Row, TableMap};
use crate::document::{Document, DocumentError, DocumentQuery, DocumentStore};
use crate::llm::{DocumentGeneration, DocumentQueryGenerator, SqlGeneration, SqlGenerator};
use crate::schema::SchemaSnapshot;

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not a document: {}", other),
    }
}

pub type CallLog = Arc<Mutex<Vec<(String, String)>>>;

/// Relational engines answering every statement with a fixed row set.
#[derive(Default)]
pub struct MemoryRelational {
    rows: BTreeMap<String, Vec<Row>>,
    tables: BTreeMap<String, TableMap>,
    failures: BTreeMap<String, ExecError>,
    default_engine: Option<String>,
    calls: CallLog,
}

impl MemoryRelational {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, name: &str, rows: Vec<Row>) -> Self {
        self.rows.insert(name.to_string(), rows);
        self.tables.entry(name.to_string()).or_default();
        self
    }

    pub fn with_table(mut self, engine: &str, table: &str, columns: &[&str]) -> Self {
        self.rows.entry(engine.to_string()).or_default();
        self.tables
            .entry(engine.to_string())
            .or_default()
            .insert(table.to_string(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_default(mut self, name: &str) -> Self {
        self.default_engine = Some(name.to_string());
        self
    }

    pub fn with_failure(mut self, name: &str, error: ExecError) -> Self {
        self.rows.entry(name.to_string()).or_default();
        self.tables.entry(name.to_string()).or_default();
        self.failures.insert(name.to_string(), error);
        self
    }

    /// (engine, sql) of every statement that reached the backend.
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl RelationalBackend for MemoryRelational {
    fn engine_names(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    fn default_engine(&self) -> Option<String> {
        self.default_engine
            .clone()
            .or_else(|| self.rows.keys().next().cloned())
    }

    async fn run(&self, engine: &str, sql: &str) -> Result<Vec<Row>, ExecError> {
        self.calls.lock().push((engine.to_string(), sql.to_string()));
        if let Some(err) = self.failures.get(engine) {
            return Err(err.clone());
        }
        self.rows
            .get(engine)
            .cloned()
            .ok_or_else(|| ExecError::connection(format!("Unknown engine '{}'", engine)))
    }

    async fn tables(&self, engine: &str) -> Result<TableMap, ExecError> {
        if let Some(err) = self.failures.get(engine) {
            return Err(err.clone());
        }
        Ok(self.tables.get(engine).cloned().unwrap_or_default())
    }
}

/// Databases -> collections -> documents, kept in insertion order for
/// databases so that driver-order enumeration can be tested.
#[derive(Default)]
pub struct MemoryDocumentStore {
    databases: Vec<(String, BTreeMap<String, Vec<Document>>)>,
    failing: BTreeSet<String>,
    calls: CallLog,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(mut self, database: &str, collection: &str, docs: Vec<Value>) -> Self {
        let docs: Vec<Document> = docs.into_iter().map(document).collect();
        match self.databases.iter_mut().find(|(name, _)| name == database) {
            Some((_, collections)) => collections.entry(collection.to_string()).or_default().extend(docs),
            None => {
                let mut collections = BTreeMap::new();
                collections.insert(collection.to_string(), docs);
                self.databases.push((database.to_string(), collections));
            }
        }
        self
    }

    pub fn with_failing_database(mut self, database: &str) -> Self {
        self.failing.insert(database.to_string());
        self
    }

    /// (database, collection) of every find issued.
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    fn database(&self, name: &str) -> Result<Option<&BTreeMap<String, Vec<Document>>>, DocumentError> {
        if self.failing.contains(name) {
            return Err(DocumentError::Driver(format!("database '{}' is offline", name)));
        }
        Ok(self.databases.iter().find(|(n, _)| n == name).map(|(_, c)| c))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn database_names(&self) -> Result<Vec<String>, DocumentError> {
        Ok(self.databases.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn collection_names(&self, database: &str) -> Result<Vec<String>, DocumentError> {
        Ok(self
            .database(database)?
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Document>, DocumentError> {
        self.calls
            .lock()
            .push((database.to_string(), collection.to_string()));
        let docs = self
            .database(database)?
            .and_then(|c| c.get(collection))
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(docs
            .iter()
            .filter(|doc| matches_filter(doc, filter))
            .take(limit as usize)
            .map(|doc| project(doc, projection))
            .collect())
    }

    async fn count(&self, database: &str, collection: &str) -> Result<Option<u64>, DocumentError> {
        Ok(self
            .database(database)?
            .and_then(|c| c.get(collection))
            .map(|docs| docs.len() as u64))
    }
}

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn matches_filter(doc: &Document, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    filter.iter().all(|(key, expected)| match key.as_str() {
        "$and" => expected
            .as_array()
            .is_some_and(|clauses| clauses.iter().all(|c| matches_filter(doc, c))),
        "$or" => expected
            .as_array()
            .is_some_and(|clauses| clauses.iter().any(|c| matches_filter(doc, c))),
        field => matches_field(lookup(doc, field), expected),
    })
}

fn matches_field(actual: Option<&Value>, expected: &Value) -> bool {
    let operators = match expected.as_object() {
        Some(map) if map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => map,
        _ => return actual == Some(expected),
    };
    operators.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$gt" => actual.and_then(|a| compare(a, operand)) == Some(Ordering::Greater),
        "$gte" => matches!(
            actual.and_then(|a| compare(a, operand)),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => actual.and_then(|a| compare(a, operand)) == Some(Ordering::Less),
        "$lte" => matches!(
            actual.and_then(|a| compare(a, operand)),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" => operand
            .as_array()
            .is_some_and(|values| actual.is_some_and(|a| values.contains(a))),
        "$nin" => operand
            .as_array()
            .is_some_and(|values| actual.map_or(true, |a| !values.contains(a))),
        "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
        _ => false,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        _ => true,
    }
}

fn project(doc: &Document, projection: Option<&Value>) -> Document {
    let Some(spec) = projection.and_then(Value::as_object) else {
        return doc.clone();
    };
    let inclusive = spec.iter().any(|(k, v)| k != "_id" && truthy(v));
    if inclusive {
        let keep_id = spec.get("_id").map_or(true, truthy);
        doc.iter()
            .filter(|(k, _)| {
                if k.as_str() == "_id" {
                    keep_id
                } else {
                    spec.get(k.as_str()).is_some_and(truthy)
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        doc.iter()
            .filter(|(k, _)| spec.get(k.as_str()).map_or(true, truthy))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// SQL generator returning a fixed answer.
pub struct ScriptedSql {
    reply: SqlGeneration,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedSql {
    pub fn new(reply: SqlGeneration) -> Self {
        Self {
            reply,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<Mutex<usize>> {
        self.calls.clone()
    }
}

#[async_trait]
impl SqlGenerator for ScriptedSql {
    async fn generate_sql(&self, _question: &str, _schema: &SchemaSnapshot) -> SqlGeneration {
        *self.calls.lock() += 1;
        self.reply.clone()
    }
}

/// Document-query generator returning a fixed answer.
pub struct ScriptedDocument {
    reply: DocumentGeneration,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedDocument {
    pub fn new(reply: DocumentGeneration) -> Self {
        Self {
            reply,
            calls: Arc::default(),
        }
    }

    pub fn query(query: DocumentQuery) -> Self {
        Self::new(DocumentGeneration::Query(query))
    }

    pub fn calls(&self) -> Arc<Mutex<usize>> {
        self.calls.clone()
    }
}

#[async_trait]
impl DocumentQueryGenerator for ScriptedDocument {
    async fn generate_document_query(&self, _question: &str, _schema: &SchemaSnapshot) -> DocumentGeneration {
        *self.calls.lock() += 1;
        self.reply.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn car() -> Document {
        document(json!({"_id": "k1", "name": "nano", "year": 2009, "specs": {"seats": 4}}))
    }

    #[test]
    fn test_filter_operators() {
        let doc = car();
        assert!(matches_filter(&doc, &json!({})));
        assert!(matches_filter(&doc, &json!({"name": "nano"})));
        assert!(matches_filter(&doc, &json!({"year": {"$gt": 2000, "$lte": 2009}})));
        assert!(matches_filter(&doc, &json!({"name": {"$in": ["nano", "swift"]}})));
        assert!(matches_filter(&doc, &json!({"name": {"$nin": ["swift"]}})));
        assert!(matches_filter(&doc, &json!({"color": {"$exists": false}})));
        assert!(matches_filter(&doc, &json!({"specs.seats": 4})));
        assert!(matches_filter(
            &doc,
            &json!({"$or": [{"name": "swift"}, {"year": {"$lt": 2010}}]})
        ));
        assert!(!matches_filter(
            &doc,
            &json!({"$and": [{"name": "nano"}, {"year": {"$ne": 2009}}]})
        ));
    }

    #[test]
    fn test_projection_modes() {
        let doc = car();
        let included = project(&doc, Some(&json!({"name": 1})));
        assert_eq!(included.keys().collect::<Vec<_>>(), vec!["_id", "name"]);
        let excluded = project(&doc, Some(&json!({"_id": 0})));
        assert!(!excluded.contains_key("_id"));
        assert_eq!(excluded.len(), 3);
    }
}

//! Document-store side: cluster connection, query execution, database
//! resolution and schema sampling.

mod cluster;
mod executor;
mod resolver;
mod schema;

pub use cluster::*;
pub use executor::*;
pub use resolver::*;
pub use schema::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One document, JSON-safe (object identifiers already rendered as strings).
pub type Document = serde_json::Map<String, Value>;

/// Databases that are never enumerated, probed or scanned.
pub const ADMIN_DATABASES: &[&str] = &["admin", "local", "config"];

pub const DEFAULT_LIMIT: u32 = 50;

pub fn is_admin_database(name: &str) -> bool {
    ADMIN_DATABASES.contains(&name)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocumentError {
    /// No candidate URI produced a reachable cluster.
    #[error("Document store not available (tried {})", .tried.join(", "))]
    Unavailable { tried: Vec<String> },
    #[error("Document store error: {0}")]
    Driver(String),
    #[error("Invalid document query: {0}")]
    InvalidQuery(String),
}

impl DocumentError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DocumentError::Unavailable { .. })
    }
}

impl From<mongodb::error::Error> for DocumentError {
    fn from(err: mongodb::error::Error) -> Self {
        DocumentError::Driver(err.to_string())
    }
}

/// A generated document query. A missing `database_name` means the
/// target database has to be resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    #[serde(default, alias = "db_name", skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(alias = "collection")]
    pub collection_name: String,
    #[serde(default = "empty_filter")]
    pub filter: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Value>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn empty_filter() -> Value {
    Value::Object(Default::default())
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

impl DocumentQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            database_name: None,
            collection_name: collection.into(),
            filter: empty_filter(),
            projection: None,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database_name = Some(database.into());
        self
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// True when the filter selects every document.
    pub fn has_filter(&self) -> bool {
        match &self.filter {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Limit actually applied; zero means the default.
    pub fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }
}

/// Order in which databases are enumerated for resolution and broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseOrder {
    #[default]
    Alphabetical,
    AsListed,
}

impl DatabaseOrder {
    pub fn apply(self, names: &mut [String]) {
        if self == DatabaseOrder::Alphabetical {
            names.sort();
        }
    }
}

/// Raw access to a document cluster.
///
/// `find` returns documents with the default projection (identity field
/// included) when `projection` is `None`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every database on the cluster, in the order the server reports them.
    async fn database_names(&self) -> Result<Vec<String>, DocumentError>;

    async fn collection_names(&self, database: &str) -> Result<Vec<String>, DocumentError>;

    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Document>, DocumentError>;

    /// Estimated number of documents, when the store can tell cheaply.
    async fn count(&self, _database: &str, _collection: &str) -> Result<Option<u64>, DocumentError> {
        Ok(None)
    }
}

use serde_json::Value;
use std::time::Instant;

use super::{
    is_admin_database, DatabaseOrder, Document, DocumentCluster, DocumentError, DocumentQuery,
    DocumentStore,
};

/// Field added to broadcast results naming the database a document came from.
pub const SOURCE_DATABASE_FIELD: &str = "_db";
/// Field added to broadcast results naming the collection a document came from.
pub const SOURCE_COLLECTION_FIELD: &str = "_collection";

/// Result of scanning one database during a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Documents(Vec<Document>),
    Failed(String),
}

impl ScanOutcome {
    pub fn documents(&self) -> &[Document] {
        match self {
            ScanOutcome::Documents(docs) => docs,
            ScanOutcome::Failed(_) => &[],
        }
    }
}

/// Runs find queries on the document cluster.
#[derive(Clone)]
pub struct DocumentExecutor {
    cluster: DocumentCluster,
    order: DatabaseOrder,
}

impl DocumentExecutor {
    pub fn new(cluster: DocumentCluster, order: DatabaseOrder) -> Self {
        Self { cluster, order }
    }

    pub fn cluster(&self) -> &DocumentCluster {
        &self.cluster
    }

    pub fn order(&self) -> DatabaseOrder {
        self.order
    }

    /// Non-administrative databases in enumeration order.
    pub async fn databases(&self) -> Result<Vec<String>, DocumentError> {
        let store = self.cluster.store()?;
        let mut names: Vec<String> = store
            .database_names()
            .await?
            .into_iter()
            .filter(|name| !is_admin_database(name))
            .collect();
        self.order.apply(&mut names);
        Ok(names)
    }

    pub async fn collections(&self, database: &str) -> Result<Vec<String>, DocumentError> {
        self.cluster.store()?.collection_names(database).await
    }

    /// Run `query` against `database`, ignoring `query.database_name`.
    pub async fn execute(&self, database: &str, query: &DocumentQuery) -> Result<Vec<Document>, DocumentError> {
        if is_admin_database(database) {
            return Err(DocumentError::InvalidQuery(format!(
                "database '{}' is not queryable",
                database
            )));
        }
        let store = self.cluster.store()?;
        let start = Instant::now();
        let docs = store
            .find(
                database,
                &query.collection_name,
                &query.filter,
                query.projection.as_ref(),
                query.effective_limit(),
            )
            .await;

        match &docs {
            Ok(docs) => tracing::info!(
                database,
                collection = %query.collection_name,
                rows = docs.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "document query executed"
            ),
            Err(e) => tracing::error!(
                database,
                collection = %query.collection_name,
                error = %e,
                "document query failed"
            ),
        }
        docs
    }

    /// Run the same find in every non-administrative database.
    ///
    /// In each database only `collection` is scanned when it exists there,
    /// otherwise every collection is. Returned documents carry `_db` and
    /// `_collection`. A failing database is reported in place without
    /// stopping the scan; only an unreachable cluster or a failed database
    /// listing is an `Err`.
    pub async fn execute_across(
        &self,
        collection: Option<&str>,
        filter: &Value,
        projection: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<(String, ScanOutcome)>, DocumentError> {
        let store = self.cluster.store()?;
        let databases = self.databases().await?;
        let limit = if limit == 0 { super::DEFAULT_LIMIT } else { limit };

        let mut results = Vec::with_capacity(databases.len());
        for database in databases {
            let outcome =
                match scan_database(store.as_ref(), &database, collection, filter, projection, limit).await {
                    Ok(docs) => ScanOutcome::Documents(docs),
                    Err(e) => {
                        tracing::warn!(database = %database, error = %e, "broadcast scan failed");
                        ScanOutcome::Failed(e.to_string())
                    }
                };
            results.push((database, outcome));
        }
        Ok(results)
    }
}

async fn scan_database(
    store: &dyn DocumentStore,
    database: &str,
    collection: Option<&str>,
    filter: &Value,
    projection: Option<&Value>,
    limit: u32,
) -> Result<Vec<Document>, DocumentError> {
    let available = store.collection_names(database).await?;
    let targets: Vec<String> = match collection {
        Some(name) if available.iter().any(|c| c == name) => vec![name.to_string()],
        _ => available,
    };

    let mut docs = Vec::new();
    for target in targets {
        for mut doc in store.find(database, &target, filter, projection, limit).await? {
            doc.insert(SOURCE_DATABASE_FIELD.to_string(), Value::String(database.to_string()));
            doc.insert(SOURCE_COLLECTION_FIELD.to_string(), Value::String(target.clone()));
            docs.push(doc);
        }
    }
    Ok(docs)
}

use serde_json::Value;

use super::{DocumentError, DocumentExecutor, DocumentQuery};

pub const DEFAULT_PREFERRED_DATABASE: &str = "cardb";

/// Finds which database on the cluster holds a collection.
///
/// The same collection name may exist in several databases, so the answer
/// is data-driven: presence listing, then probing with the filter, then a
/// static preference.
#[derive(Clone)]
pub struct Resolver {
    executor: DocumentExecutor,
    preferred: Option<String>,
    probe_limit: u32,
}

impl Resolver {
    pub fn new(executor: DocumentExecutor, preferred: Option<String>) -> Self {
        Self {
            executor,
            preferred,
            probe_limit: 1,
        }
    }

    pub fn with_probe_limit(mut self, probe_limit: u32) -> Self {
        self.probe_limit = probe_limit.max(1);
        self
    }

    /// Databases that contain `collection`, in enumeration order. A database
    /// whose collections cannot be listed is skipped.
    pub async fn candidates(&self, collection: &str) -> Result<Vec<String>, DocumentError> {
        let mut candidates = Vec::new();
        for database in self.executor.databases().await? {
            match self.executor.collections(&database).await {
                Ok(names) if names.iter().any(|n| n == collection) => candidates.push(database),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(database = %database, error = %e, "cannot list collections, skipping")
                }
            }
        }
        Ok(candidates)
    }

    /// Database holding `collection`, or `None` when no database has it.
    ///
    /// `Err` only when the cluster cannot be enumerated at all.
    pub async fn resolve(&self, collection: &str, filter: Option<&Value>) -> Result<Option<String>, DocumentError> {
        self.resolve_excluding(collection, filter, None).await
    }

    /// Like [`resolve`](Self::resolve), never answering `exclude`.
    pub async fn resolve_excluding(
        &self,
        collection: &str,
        filter: Option<&Value>,
        exclude: Option<&str>,
    ) -> Result<Option<String>, DocumentError> {
        let mut candidates = self.candidates(collection).await?;
        if let Some(exclude) = exclude {
            candidates.retain(|db| db != exclude);
        }

        match candidates.len() {
            0 => {
                tracing::debug!(collection, "no database holds collection");
                return Ok(None);
            }
            1 => return Ok(candidates.pop()),
            _ => {}
        }

        let filter = filter.filter(|f| match f {
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
            _ => true,
        });

        if let Some(filter) = filter {
            let probe = DocumentQuery::new(collection)
                .with_filter(filter.clone())
                .with_limit(self.probe_limit);
            for database in &candidates {
                match self.executor.execute(database, &probe).await {
                    Ok(docs) if !docs.is_empty() => {
                        tracing::info!(collection, database = %database, "resolved by probe");
                        return Ok(Some(database.clone()));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(database = %database, error = %e, "probe failed"),
                }
            }
        }

        let chosen = self
            .preferred
            .as_ref()
            .filter(|preferred| candidates.contains(preferred))
            .cloned()
            .or_else(|| candidates.into_iter().next());
        tracing::info!(collection, database = ?chosen, "resolved by preference");
        Ok(chosen)
    }
}

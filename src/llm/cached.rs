use async_trait::async_trait;

use super::{DocumentGeneration, DocumentQueryGenerator, SqlGeneration, SqlGenerator};
use crate::cache::{cache_key, CacheConfig, TtlCache};
use crate::schema::SchemaSnapshot;

/// Memoizes successful generations per question. Failed and empty
/// generations are never cached, so a transient error is retried on the
/// next request.
pub struct CachedGenerator<G> {
    inner: G,
    sql: TtlCache<SqlGeneration>,
    documents: TtlCache<DocumentGeneration>,
    enabled: bool,
}

impl<G> CachedGenerator<G> {
    pub fn new(inner: G, config: &CacheConfig) -> Self {
        Self {
            inner,
            sql: TtlCache::from_config(config),
            documents: TtlCache::from_config(config),
            enabled: config.enabled,
        }
    }

    pub fn clear(&self) {
        self.sql.clear();
        self.documents.clear();
    }
}

#[async_trait]
impl<G: SqlGenerator> SqlGenerator for CachedGenerator<G> {
    async fn generate_sql(&self, question: &str, schema: &SchemaSnapshot) -> SqlGeneration {
        if !self.enabled {
            return self.inner.generate_sql(question, schema).await;
        }
        let key = cache_key("sql", question);
        if let Some(hit) = self.sql.get(&key) {
            tracing::debug!("sql generation served from cache");
            return hit;
        }
        let generated = self.inner.generate_sql(question, schema).await;
        if !matches!(generated, SqlGeneration::Failed(_)) {
            self.sql.insert(key, generated.clone());
        }
        generated
    }
}

#[async_trait]
impl<G: DocumentQueryGenerator> DocumentQueryGenerator for CachedGenerator<G> {
    async fn generate_document_query(&self, question: &str, schema: &SchemaSnapshot) -> DocumentGeneration {
        if !self.enabled {
            return self.inner.generate_document_query(question, schema).await;
        }
        let key = cache_key("document", question);
        if let Some(hit) = self.documents.get(&key) {
            tracing::debug!("document generation served from cache");
            return hit;
        }
        let generated = self.inner.generate_document_query(question, schema).await;
        if matches!(generated, DocumentGeneration::Query(_)) {
            self.documents.insert(key, generated.clone());
        }
        generated
    }
}

//! Dual-backend routing: relational first, document store second.

mod intent;
mod response;

pub use intent::*;
pub use response::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::db::{merge_rows, EngineOutcome, RelationalExecutor};
use crate::document::{Document, DocumentError, DocumentExecutor, DocumentQuery, Resolver, ScanOutcome};
use crate::llm::{DocumentGeneration, DocumentQueryGenerator, SqlGeneration, SqlGenerator};
use crate::schema::{CollectionRef, SchemaSnapshot, TableRef};

const SCHEMA_CACHE_KEY: &str = "schema";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Put generated query text into responses.
    #[serde(default)]
    pub expose_queries: bool,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    /// How long an introspected schema is reused.
    #[serde(default = "default_schema_ttl_secs")]
    pub schema_ttl_secs: u64,
}

fn default_max_suggestions() -> usize {
    5
}

fn default_schema_ttl_secs() -> u64 {
    300
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            expose_queries: false,
            max_suggestions: default_max_suggestions(),
            schema_ttl_secs: default_schema_ttl_secs(),
        }
    }
}

/// What happened on each backend during one request.
#[derive(Debug, Default)]
struct Attempts {
    sql_error: Option<String>,
    mongo_error: Option<String>,
    rejected: bool,
    query: Option<String>,
}

/// Documents found for a document query.
struct DocumentHit {
    database: String,
    rows: Vec<Document>,
    broadcast: bool,
}

/// Answers one question at a time against both backends.
///
/// Cheap to clone; all state is shared and read-only apart from the
/// schema cache.
#[derive(Clone)]
pub struct Router {
    relational: RelationalExecutor,
    documents: DocumentExecutor,
    resolver: Resolver,
    sql_generator: Arc<dyn SqlGenerator>,
    document_generator: Arc<dyn DocumentQueryGenerator>,
    schema_cache: Arc<TtlCache<SchemaSnapshot>>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        relational: RelationalExecutor,
        documents: DocumentExecutor,
        resolver: Resolver,
        sql_generator: Arc<dyn SqlGenerator>,
        document_generator: Arc<dyn DocumentQueryGenerator>,
        config: RouterConfig,
    ) -> Self {
        let schema_cache = Arc::new(TtlCache::new(Duration::from_secs(config.schema_ttl_secs), 1));
        Self {
            relational,
            documents,
            resolver,
            sql_generator,
            document_generator,
            schema_cache,
            config,
        }
    }

    /// Current schema of both backends, introspected at most once per TTL.
    pub async fn schema(&self) -> SchemaSnapshot {
        if let Some(snapshot) = self.schema_cache.get(SCHEMA_CACHE_KEY) {
            return snapshot;
        }
        let snapshot = SchemaSnapshot::collect(&self.relational, &self.documents).await;
        self.schema_cache.insert(SCHEMA_CACHE_KEY.to_string(), snapshot.clone());
        snapshot
    }

    pub fn refresh_schema(&self) {
        self.schema_cache.clear();
    }

    /// Route one question. Never fails: a panic anywhere below is turned
    /// into a `server_error` response.
    pub async fn route(&self, question: &str) -> RouteResponse {
        let router = self.clone();
        let question = question.to_string();
        match tokio::spawn(async move { router.route_question(&question).await }).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "request handling aborted");
                RouteResponse::server_error()
            }
        }
    }

    async fn route_question(&self, question: &str) -> RouteResponse {
        let question = question.trim();
        if question.is_empty() {
            return RouteResponse::new(ResponseKind::Failure, "Please ask a question about your data.")
                .with_suggestions(rephrasing_tips());
        }

        let intent = classify(question);
        tracing::info!(question, intent = ?intent, "routing question");
        let schema = self.schema().await;

        match &intent {
            Intent::Greeting | Intent::Help => return self.greeting(&intent, &schema),
            Intent::Existence { subject, column } => {
                if let Some(table) = schema.find_table(subject) {
                    return table_existence(&table, column.as_deref());
                }
            }
            Intent::Data { .. } => {}
        }
        let chart = match intent {
            Intent::Data { chart } => chart,
            _ => None,
        };

        let mut attempts = Attempts::default();

        if let Some(mut response) = self.relational_attempt(question, &schema, &mut attempts).await {
            response.chart = chart;
            return response;
        }

        if let Intent::Existence { subject, column } = &intent {
            if let Some(collection) = schema.find_collection(subject) {
                return collection_existence(&collection, column.as_deref());
            }
        }

        if let Some(mut response) = self.document_attempt(question, &schema, &mut attempts).await {
            response.chart = chart;
            return response;
        }

        self.failure(&schema, attempts)
    }

    fn greeting(&self, intent: &Intent, schema: &SchemaSnapshot) -> RouteResponse {
        let answer = match intent {
            Intent::Help => {
                "Ask a question about your data in plain language. I turn it into a read-only query, \
                 try the relational databases first and fall back to the document store. For example:"
            }
            _ => "Hello! I can answer questions about your data. Here are some things you can ask:",
        };
        let mut suggestions = schema_suggestions(schema, self.config.max_suggestions);
        if suggestions.is_empty() {
            suggestions = rephrasing_tips();
        }
        RouteResponse::new(ResponseKind::Greeting, answer).with_suggestions(suggestions)
    }

    async fn relational_attempt(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        attempts: &mut Attempts,
    ) -> Option<RouteResponse> {
        if self.relational.backend().engine_names().is_empty() {
            attempts.sql_error = Some("No relational database is configured".to_string());
            return None;
        }

        let outcomes = match self.sql_generator.generate_sql(question, schema).await {
            SqlGeneration::Failed(reason) => {
                tracing::warn!(reason = %reason, "sql generation failed");
                attempts.sql_error = Some(reason);
                return None;
            }
            SqlGeneration::Single(sql) => {
                attempts.query = Some(sql.clone());
                // the prompt only listed one engine's tables, so run it there
                match sole_introspected_engine(schema) {
                    Some(engine) => self.relational.execute(&BTreeMap::from([(engine, sql)])).await,
                    None => {
                        let (engine, outcome) = self.relational.execute_one(&sql).await;
                        BTreeMap::from([(engine, outcome)])
                    }
                }
            }
            SqlGeneration::PerEngine(queries) => {
                attempts.query = serde_json::to_string(&queries).ok();
                self.relational.execute(&queries).await
            }
        };

        if outcomes.is_empty() {
            attempts.sql_error = Some("The generated queries named no configured database".to_string());
            return None;
        }

        let (rows, contributing) = merge_rows(&outcomes);
        if !rows.is_empty() {
            let mut response = if contributing.len() == 1 {
                let engine = contributing.keys().next().cloned().unwrap_or_default();
                let mut response = RouteResponse::data(Backend::Relational, rows, single_source(&engine));
                response.db_name_used = Some(engine);
                response
            } else {
                let mut response =
                    RouteResponse::data(Backend::Relational, rows, MULTIPLE_SOURCES.to_string());
                response.per_source = contributing;
                response
            };
            if self.config.expose_queries {
                response.query = attempts.query.take();
            }
            tracing::info!(rows = response.row_count(), source = ?response.source, "answered from relational backend");
            return Some(response);
        }

        attempts.rejected = outcomes.values().any(EngineOutcome::is_rejected);
        let errors: Vec<String> = outcomes
            .iter()
            .filter_map(|(engine, outcome)| outcome.error_message().map(|m| format!("{}: {}", engine, m)))
            .collect();
        if !errors.is_empty() {
            attempts.sql_error = Some(errors.join("; "));
        }
        tracing::info!(engines = outcomes.len(), errors = errors.len(), "relational backend returned no rows");
        None
    }

    async fn document_attempt(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        attempts: &mut Attempts,
    ) -> Option<RouteResponse> {
        if let Err(e) = self.documents.cluster().store() {
            attempts.mongo_error = Some(e.to_string());
            return None;
        }

        let query = match self.document_generator.generate_document_query(question, schema).await {
            DocumentGeneration::Query(query) => query,
            DocumentGeneration::Empty => {
                attempts.mongo_error = Some("No document query could be generated for this question".to_string());
                return None;
            }
            DocumentGeneration::Failed(reason) => {
                tracing::warn!(reason = %reason, "document query generation failed");
                attempts.mongo_error = Some(reason);
                return None;
            }
        };
        let rendered = serde_json::to_string(&query).ok();

        match self.find_documents(&query).await {
            Ok(Some(hit)) => {
                let mut response = if hit.broadcast {
                    let mut response =
                        RouteResponse::data(Backend::Document, hit.rows.clone(), MULTIPLE_SOURCES.to_string());
                    response.per_source.insert(hit.database, hit.rows);
                    response.db_name_used = Some(MULTIPLE_SOURCES.to_string());
                    response
                } else {
                    let mut response =
                        RouteResponse::data(Backend::Document, hit.rows, single_source(&hit.database));
                    response.db_name_used = Some(hit.database);
                    response
                };
                if self.config.expose_queries {
                    response.query = rendered;
                }
                tracing::info!(rows = response.row_count(), database = ?response.db_name_used, "answered from document backend");
                Some(response)
            }
            Ok(None) => {
                if attempts.query.is_none() {
                    attempts.query = rendered;
                }
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "document query failed");
                attempts.mongo_error = Some(e.to_string());
                None
            }
        }
    }

    /// Direct run, then an alternate database from the resolver, then a
    /// broadcast where the first non-empty database wins.
    async fn find_documents(&self, query: &DocumentQuery) -> Result<Option<DocumentHit>, DocumentError> {
        let collection = query.collection_name.as_str();
        let filter = Some(&query.filter);
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;

        let target = match &query.database_name {
            Some(database) => Some(database.clone()),
            None => self.resolver.resolve(collection, filter).await?,
        };

        if let Some(database) = target {
            if let Some(hit) = self.try_database(&database, query, &mut tried, &mut last_error).await {
                return Ok(Some(hit));
            }
            if query.database_name.is_some() {
                let alternate = self
                    .resolver
                    .resolve_excluding(collection, filter, Some(&database))
                    .await?;
                if let Some(alternate) = alternate {
                    if let Some(hit) = self.try_database(&alternate, query, &mut tried, &mut last_error).await {
                        return Ok(Some(hit));
                    }
                }
            }
        }

        let scans = self
            .documents
            .execute_across(
                Some(collection),
                &query.filter,
                query.projection.as_ref(),
                query.effective_limit(),
            )
            .await?;
        for (database, outcome) in scans {
            if tried.contains(&database) {
                continue;
            }
            match outcome {
                ScanOutcome::Documents(rows) if !rows.is_empty() => {
                    return Ok(Some(DocumentHit {
                        database,
                        rows,
                        broadcast: true,
                    }));
                }
                ScanOutcome::Documents(_) => {}
                ScanOutcome::Failed(message) => last_error = Some(DocumentError::Driver(message)),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn try_database(
        &self,
        database: &str,
        query: &DocumentQuery,
        tried: &mut Vec<String>,
        last_error: &mut Option<DocumentError>,
    ) -> Option<DocumentHit> {
        tried.push(database.to_string());
        match self.documents.execute(database, query).await {
            Ok(rows) if !rows.is_empty() => Some(DocumentHit {
                database: database.to_string(),
                rows,
                broadcast: false,
            }),
            Ok(_) => None,
            Err(e) => {
                *last_error = Some(e);
                None
            }
        }
    }

    fn failure(&self, schema: &SchemaSnapshot, attempts: Attempts) -> RouteResponse {
        let mut suggestions = schema_suggestions(schema, self.config.max_suggestions);
        suggestions.extend(rephrasing_tips());

        let fragments: Vec<String> = [("SQL error", &attempts.sql_error), ("MongoDB error", &attempts.mongo_error)]
            .into_iter()
            .filter_map(|(label, error)| error.as_ref().map(|e| format!("{}: {}", label, e)))
            .collect();

        let (kind, answer) = if attempts.rejected {
            (
                ResponseKind::SecurityRefusal,
                "Security Alert: Your request implies an unauthorized or unsafe database operation. \
                 I can only execute safe SELECT queries. Please rephrase your question.",
            )
        } else if fragments.is_empty() {
            (
                ResponseKind::NoData,
                "I couldn't find any data matching your request in either data source.",
            )
        } else {
            (
                ResponseKind::Failure,
                "I couldn't answer your question from either data source.",
            )
        };
        tracing::info!(kind = ?kind, errors = ?fragments, "request ended without rows");

        let mut response = RouteResponse::new(kind, answer).with_suggestions(suggestions);
        if !fragments.is_empty() {
            response.error = Some(fragments.join(" | "));
        }
        if self.config.expose_queries {
            response.query = attempts.query;
        }
        response
    }
}

fn sole_introspected_engine(schema: &SchemaSnapshot) -> Option<String> {
    match schema.relational.len() {
        1 => schema.relational.keys().next().cloned(),
        _ => None,
    }
}

fn find_name<'a>(names: impl IntoIterator<Item = &'a String>, wanted: &str) -> Option<&'a String> {
    names.into_iter().find(|n| n.eq_ignore_ascii_case(wanted))
}

fn table_existence(table: &TableRef<'_>, column: Option<&str>) -> RouteResponse {
    let answer = match column {
        None => format!(
            "Yes, the table `{}` exists in {} with columns: {}.",
            table.table,
            table.engine,
            table.columns.join(", ")
        ),
        Some(wanted) => match find_name(table.columns, wanted) {
            Some(found) => format!("Yes, the table `{}` has a column `{}`.", table.table, found),
            None => format!(
                "No, the table `{}` has no column `{}`. Available columns: {}.",
                table.table,
                wanted,
                table.columns.join(", ")
            ),
        },
    };
    let mut response = RouteResponse::new(ResponseKind::Existence, answer);
    response.backend = Backend::Relational;
    response.source = Some(single_source(table.engine));
    response.db_name_used = Some(table.engine.to_string());
    response
}

fn collection_existence(collection: &CollectionRef<'_>, field: Option<&str>) -> RouteResponse {
    let fields: Vec<&str> = collection.schema.fields.keys().map(String::as_str).collect();
    let answer = match field {
        None => format!(
            "Yes, the collection `{}` exists in {} with fields: {}.",
            collection.collection,
            collection.database,
            fields.join(", ")
        ),
        Some(wanted) => match find_name(collection.schema.fields.keys(), wanted) {
            Some(found) => format!(
                "Yes, the collection `{}` has a field `{}`.",
                collection.collection, found
            ),
            None => format!(
                "No, the collection `{}` has no field `{}`. Available fields: {}.",
                collection.collection,
                wanted,
                fields.join(", ")
            ),
        },
    };
    let mut response = RouteResponse::new(ResponseKind::Existence, answer);
    response.backend = Backend::Document;
    response.source = Some(single_source(collection.database));
    response.db_name_used = Some(collection.database.to_string());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ExecError;
    use crate::document::{DatabaseOrder, DocumentCluster};
    use crate::testing::{row, MemoryDocumentStore, MemoryRelational, ScriptedDocument, ScriptedSql};
    use async_trait::async_trait;
    use serde_json::json;

    struct Setup {
        relational: MemoryRelational,
        documents: Option<MemoryDocumentStore>,
        order: DatabaseOrder,
        sql: SqlGeneration,
        document: DocumentGeneration,
        config: RouterConfig,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                relational: MemoryRelational::new(),
                documents: Some(MemoryDocumentStore::new()),
                order: DatabaseOrder::Alphabetical,
                sql: SqlGeneration::Failed("not scripted".into()),
                document: DocumentGeneration::Empty,
                config: RouterConfig::default(),
            }
        }

        fn relational(mut self, relational: MemoryRelational) -> Self {
            self.relational = relational;
            self
        }

        fn documents(mut self, documents: MemoryDocumentStore) -> Self {
            self.documents = Some(documents);
            self
        }

        fn documents_unavailable(mut self) -> Self {
            self.documents = None;
            self
        }

        fn order(mut self, order: DatabaseOrder) -> Self {
            self.order = order;
            self
        }

        fn sql(mut self, sql: SqlGeneration) -> Self {
            self.sql = sql;
            self
        }

        fn document(mut self, document: DocumentGeneration) -> Self {
            self.document = document;
            self
        }

        fn build(self) -> (Router, CallCounts) {
            let relational_calls = self.relational.call_log();
            let document_calls = self.documents.as_ref().map(|d| d.call_log());
            let cluster = match self.documents {
                Some(store) => DocumentCluster::from_store(Arc::new(store)),
                None => DocumentCluster::Unavailable {
                    tried: vec!["mongodb://localhost:27017/".into()],
                },
            };
            let sql = ScriptedSql::new(self.sql);
            let document = ScriptedDocument::new(self.document);
            let counts = CallCounts {
                relational_calls,
                document_calls,
                sql_calls: sql.calls(),
                document_generator_calls: document.calls(),
            };
            let documents = DocumentExecutor::new(cluster, self.order);
            let resolver = Resolver::new(documents.clone(), Some("cardb".into()));
            let router = Router::new(
                RelationalExecutor::new(Arc::new(self.relational)),
                documents,
                resolver,
                Arc::new(sql),
                Arc::new(document),
                self.config,
            );
            (router, counts)
        }
    }

    struct CallCounts {
        relational_calls: crate::testing::CallLog,
        document_calls: Option<crate::testing::CallLog>,
        sql_calls: Arc<parking_lot::Mutex<usize>>,
        document_generator_calls: Arc<parking_lot::Mutex<usize>>,
    }

    fn books_engines() -> MemoryRelational {
        MemoryRelational::new()
            .with_engine("db1", vec![])
            .with_table("db2", "books", &["title", "author", "year"])
            .with_engine(
                "db2",
                vec![
                    row(&[("title", json!("Dune")), ("author", json!("Herbert")), ("year", json!(1965))]),
                    row(&[("title", json!("Emma")), ("author", json!("Austen")), ("year", json!(1815))]),
                    row(&[("title", json!("Ulysses")), ("author", json!("Joyce")), ("year", json!(1922))]),
                ],
            )
    }

    fn image_store() -> MemoryDocumentStore {
        MemoryDocumentStore::new()
            .with_documents("photodb", "images", vec![])
            .with_documents(
                "cardb",
                "images",
                vec![
                    json!({"_id": "i1", "name": "nano", "filename": "nano.png"}),
                    json!({"_id": "i2", "name": "swift", "filename": "swift.png"}),
                ],
            )
    }

    fn images_query() -> DocumentGeneration {
        DocumentGeneration::Query(DocumentQuery::new("images").with_filter(json!({"name": "nano"})))
    }

    fn books_sql() -> SqlGeneration {
        SqlGeneration::PerEngine(BTreeMap::from([(
            "db2".to_string(),
            "SELECT title, author, year FROM books".to_string(),
        )]))
    }

    #[tokio::test]
    async fn test_scenario_books_from_relational() {
        let (router, counts) = Setup::new().relational(books_engines()).sql(books_sql()).build();
        let response = router.route("Show me all books").await;

        assert_eq!(response.kind, ResponseKind::Data);
        assert!(response.success);
        assert_eq!(response.backend, Backend::Relational);
        assert_eq!(response.row_count(), 3);
        assert_eq!(response.source.as_deref(), Some("single:db2"));
        assert_eq!(response.answer, "Here are the results from your query. Found 3 record(s).");
        assert!(response.query.is_none());
        assert_eq!(counts.relational_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_images_resolved_by_filter_lookup() {
        // photodb is listed first, so the resolver has to visit it before cardb
        let (router, counts) = Setup::new()
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .sql(SqlGeneration::Single("SELECT * FROM images".into()))
            .documents(
                MemoryDocumentStore::new()
                    .with_documents("photodb", "images", vec![json!({"_id": "p1", "name": "sunset"})])
                    .with_documents("cardb", "images", vec![json!({"_id": "c1", "name": "nano"})]),
            )
            .order(DatabaseOrder::AsListed)
            .document(images_query())
            .build();
        let finds = counts.document_calls.unwrap();
        router.schema().await;
        finds.lock().clear();

        let response = router.route("find images where name is nano").await;
        assert_eq!(response.kind, ResponseKind::Data);
        assert_eq!(response.backend, Backend::Document);
        assert_eq!(response.db_name_used.as_deref(), Some("cardb"));
        assert_eq!(response.source.as_deref(), Some("single:cardb"));
        assert_eq!(response.rows[0]["_id"], json!("c1"));

        let visited: Vec<String> = finds
            .lock()
            .iter()
            .filter(|(_, c)| c == "images")
            .map(|(db, _)| db.clone())
            .collect();
        assert!(visited.contains(&"photodb".to_string()));
        assert!(visited.contains(&"cardb".to_string()));
    }

    #[tokio::test]
    async fn test_scenario_greeting_touches_no_backend() {
        let (router, counts) = Setup::new()
            .relational(books_engines())
            .documents(image_store())
            .sql(books_sql())
            .document(images_query())
            .build();
        let response = router.route("hello").await;

        assert_eq!(response.kind, ResponseKind::Greeting);
        assert!(response.success);
        assert!(response.suggestions.contains(&"Show me all books".to_string()));
        assert!(response.suggestions.len() <= 5);
        assert!(counts.relational_calls.lock().is_empty());
        assert_eq!(*counts.sql_calls.lock(), 0);
        assert_eq!(*counts.document_generator_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_scenario_dual_failure_reports_both_errors() {
        let relational = MemoryRelational::new()
            .with_failure("db1", ExecError::connection("connection refused on db1"))
            .with_failure("db2", ExecError::connection("connection refused on db2"));
        let sql = SqlGeneration::PerEngine(BTreeMap::from([
            ("db1".to_string(), "SELECT * FROM books".to_string()),
            ("db2".to_string(), "SELECT * FROM books".to_string()),
        ]));
        let (router, counts) = Setup::new()
            .relational(relational)
            .sql(sql)
            .documents(image_store())
            .document(DocumentGeneration::Failed("model quota exhausted".into()))
            .build();
        let response = router.route("Show me all books").await;

        assert_eq!(response.kind, ResponseKind::Failure);
        assert!(!response.success);
        let error = response.error.unwrap();
        assert!(error.starts_with("SQL error: "));
        assert!(error.contains("db1: "));
        assert!(error.contains("connection refused on db1"));
        assert!(error.contains("db2: "));
        assert!(error.contains("connection refused on db2"));
        assert!(error.contains(" | MongoDB error: model quota exhausted"));
        assert_eq!(counts.relational_calls.lock().len(), 2);
        assert!(!response.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_single_query_runs_on_the_only_reachable_engine() {
        // db1 is the default engine but could not be introspected
        let relational = MemoryRelational::new()
            .with_failure("db1", ExecError::connection("db1 is down"))
            .with_table("db2", "books", &["title", "author", "year"])
            .with_engine("db2", vec![row(&[("title", json!("Dune"))]), row(&[("title", json!("Emma"))])]);
        let (router, counts) = Setup::new()
            .relational(relational)
            .sql(SqlGeneration::Single("SELECT title FROM books".into()))
            .documents(image_store())
            .document(images_query())
            .build();
        let response = router.route("list the book titles").await;

        assert_eq!(response.kind, ResponseKind::Data);
        assert_eq!(response.backend, Backend::Relational);
        assert_eq!(response.row_count(), 2);
        assert_eq!(response.source.as_deref(), Some("single:db2"));
        assert_eq!(response.db_name_used.as_deref(), Some("db2"));
        let engines: Vec<String> = counts.relational_calls.lock().iter().map(|(e, _)| e.clone()).collect();
        assert_eq!(engines, vec!["db2".to_string()]);
        assert_eq!(*counts.document_generator_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_relational_precedence() {
        let (router, counts) = Setup::new()
            .relational(books_engines())
            .sql(books_sql())
            .documents(image_store())
            .document(images_query())
            .build();
        let response = router.route("Show me all books").await;
        assert_eq!(response.backend, Backend::Relational);
        assert_eq!(*counts.document_generator_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_fallback_when_generator_fails() {
        let (router, counts) = Setup::new()
            .relational(books_engines())
            .sql(SqlGeneration::Failed("no table matches".into()))
            .documents(image_store())
            .document(images_query())
            .build();
        let response = router.route("find images where name is nano").await;
        assert_eq!(response.backend, Backend::Document);
        assert_eq!(response.db_name_used.as_deref(), Some("cardb"));
        assert!(counts.relational_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_when_relational_empty() {
        let (router, _) = Setup::new()
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .sql(SqlGeneration::Single("SELECT * FROM images".into()))
            .documents(image_store())
            .document(images_query())
            .build();
        let response = router.route("find images where name is nano").await;
        assert_eq!(response.backend, Backend::Document);
        assert_eq!(response.row_count(), 1);
    }

    #[tokio::test]
    async fn test_rows_from_several_engines_are_tagged_multiple() {
        let relational = MemoryRelational::new()
            .with_engine("db1", vec![row(&[("n", json!(1))])])
            .with_engine("db2", vec![row(&[("n", json!(2))])]);
        let sql = SqlGeneration::PerEngine(BTreeMap::from([
            ("db1".to_string(), "SELECT n FROM t".to_string()),
            ("db2".to_string(), "SELECT n FROM t".to_string()),
        ]));
        let (router, _) = Setup::new().relational(relational).sql(sql).build();
        let response = router.route("list every n").await;
        assert_eq!(response.source.as_deref(), Some(MULTIPLE_SOURCES));
        assert_eq!(response.per_source.len(), 2);
        assert_eq!(response.row_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_sql_becomes_security_refusal() {
        let (router, counts) = Setup::new()
            .relational(books_engines())
            .sql(SqlGeneration::Single("DROP TABLE books".into()))
            .documents(image_store())
            .document(DocumentGeneration::Empty)
            .build();
        let response = router.route("remove all the books").await;
        assert_eq!(response.kind, ResponseKind::SecurityRefusal);
        assert!(response.answer.starts_with("Security Alert"));
        assert!(counts.relational_calls.lock().is_empty());
        assert_eq!(*counts.document_generator_calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_rejected_sql_still_falls_back_to_documents() {
        let (router, _) = Setup::new()
            .relational(books_engines())
            .sql(SqlGeneration::Single("SELECT * FROM a UNION SELECT * FROM b".into()))
            .documents(image_store())
            .document(images_query())
            .build();
        let response = router.route("find images where name is nano").await;
        assert_eq!(response.kind, ResponseKind::Data);
        assert_eq!(response.backend, Backend::Document);
    }

    #[tokio::test]
    async fn test_unavailable_document_store_is_reported() {
        let (router, counts) = Setup::new()
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .sql(SqlGeneration::Single("SELECT * FROM books".into()))
            .documents_unavailable()
            .document(images_query())
            .build();
        let response = router.route("find images where name is nano").await;
        assert_eq!(response.kind, ResponseKind::Failure);
        assert!(response.error.unwrap().contains("Document store not available"));
        assert_eq!(*counts.document_generator_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_no_rows_anywhere_is_no_data() {
        let (router, _) = Setup::new()
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .sql(SqlGeneration::Single("SELECT * FROM books WHERE year > 3000".into()))
            .documents(image_store())
            .document(DocumentGeneration::Query(
                DocumentQuery::new("images").with_filter(json!({"name": "zzz"})),
            ))
            .build();
        let response = router.route("books from the future").await;
        assert_eq!(response.kind, ResponseKind::NoData);
        assert!(response.error.is_none());
        assert!(!response.suggestions.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_database_falls_back_to_alternate() {
        let store = MemoryDocumentStore::new()
            .with_documents("cardb", "images", vec![json!({"name": "sunset"})])
            .with_documents("photodb", "images", vec![json!({"name": "nano"})]);
        let (router, _) = Setup::new()
            .sql(SqlGeneration::Failed("skip".into()))
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .documents(store)
            .document(DocumentGeneration::Query(
                DocumentQuery::new("images")
                    .in_database("cardb")
                    .with_filter(json!({"name": "nano"})),
            ))
            .build();
        let response = router.route("find images where name is nano").await;
        assert_eq!(response.db_name_used.as_deref(), Some("photodb"));
        assert_eq!(response.source.as_deref(), Some("single:photodb"));
    }

    #[tokio::test]
    async fn test_explicit_then_alternate_then_broadcast() {
        // alpha and beta hold images without a match; gamma only has the
        // match in another collection, so just the broadcast can find it
        let store = MemoryDocumentStore::new()
            .with_documents("alpha", "images", vec![json!({"name": "sunset"})])
            .with_documents("beta", "images", vec![json!({"name": "harbour"})])
            .with_documents("gamma", "photos", vec![json!({"_id": "g1", "name": "nano"})]);
        let (router, counts) = Setup::new()
            .sql(SqlGeneration::Failed("skip".into()))
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .documents(store)
            .document(DocumentGeneration::Query(
                DocumentQuery::new("images")
                    .in_database("alpha")
                    .with_filter(json!({"name": "nano"})),
            ))
            .build();
        let response = router.route("find images where name is nano").await;

        assert_eq!(response.kind, ResponseKind::Data);
        assert_eq!(response.backend, Backend::Document);
        assert_eq!(response.db_name_used.as_deref(), Some(MULTIPLE_SOURCES));
        assert_eq!(response.source.as_deref(), Some(MULTIPLE_SOURCES));
        assert_eq!(response.row_count(), 1);
        assert_eq!(response.rows[0]["_db"], json!("gamma"));
        assert_eq!(response.rows[0]["_collection"], json!("photos"));
        let sources: Vec<&String> = response.per_source.keys().collect();
        assert_eq!(sources, vec!["gamma"]);

        let finds = counts.document_calls.unwrap();
        let direct: Vec<String> = finds
            .lock()
            .iter()
            .filter(|(_, c)| c == "images")
            .map(|(db, _)| db.clone())
            .collect();
        assert!(direct.contains(&"alpha".to_string()));
        assert!(direct.contains(&"beta".to_string()));
    }

    #[tokio::test]
    async fn test_broadcast_when_collection_unknown_everywhere() {
        let store = MemoryDocumentStore::new()
            .with_documents("cardb", "cars", vec![json!({"name": "nano"})])
            .with_documents("photodb", "images", vec![json!({"name": "sunset"})]);
        let (router, _) = Setup::new()
            .sql(SqlGeneration::Failed("skip".into()))
            .relational(MemoryRelational::new().with_engine("db1", vec![]))
            .documents(store)
            .document(DocumentGeneration::Query(
                DocumentQuery::new("vehicles").with_filter(json!({"name": "nano"})),
            ))
            .build();
        let response = router.route("find vehicles named nano").await;
        assert_eq!(response.backend, Backend::Document);
        assert_eq!(response.db_name_used.as_deref(), Some(MULTIPLE_SOURCES));
        assert_eq!(response.rows[0]["_db"], json!("cardb"));
        assert!(response.per_source.contains_key("cardb"));
    }

    #[tokio::test]
    async fn test_existence_from_relational_schema() {
        let (router, counts) = Setup::new().relational(books_engines()).build();
        let response = router.route("Is there a column year in the books table?").await;
        assert_eq!(response.kind, ResponseKind::Existence);
        assert_eq!(response.answer, "Yes, the table `books` has a column `year`.");
        assert_eq!(*counts.sql_calls.lock(), 0);

        let response = router.route("does the books table exist").await;
        assert!(response.answer.contains("title, author, year"));
    }

    #[tokio::test]
    async fn test_existence_from_document_schema() {
        let (router, counts) = Setup::new()
            .relational(books_engines())
            .sql(SqlGeneration::Failed("not a data question".into()))
            .documents(image_store())
            .build();
        let response = router.route("is there a collection named images?").await;
        assert_eq!(response.kind, ResponseKind::Existence);
        assert_eq!(response.backend, Backend::Document);
        assert!(response.answer.contains("exists in cardb"));
        assert_eq!(*counts.document_generator_calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_expose_queries() {
        let mut setup = Setup::new().relational(books_engines()).sql(books_sql());
        setup.config.expose_queries = true;
        let (router, _) = setup.build();
        let response = router.route("Show me all books").await;
        assert!(response.query.unwrap().contains("SELECT title, author, year FROM books"));
    }

    #[tokio::test]
    async fn test_chart_hint_carried() {
        let (router, _) = Setup::new().relational(books_engines()).sql(books_sql()).build();
        let response = router.route("plot books per year as a trend").await;
        assert_eq!(response.chart, Some(ChartKind::Line));
    }

    struct PanickingGenerator;

    #[async_trait]
    impl SqlGenerator for PanickingGenerator {
        async fn generate_sql(&self, _question: &str, _schema: &SchemaSnapshot) -> SqlGeneration {
            panic!("generator exploded")
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_server_error() {
        let documents = DocumentExecutor::new(
            DocumentCluster::from_store(Arc::new(image_store())),
            DatabaseOrder::Alphabetical,
        );
        let router = Router::new(
            RelationalExecutor::new(Arc::new(books_engines())),
            documents.clone(),
            Resolver::new(documents, None),
            Arc::new(PanickingGenerator),
            Arc::new(ScriptedDocument::new(DocumentGeneration::Empty)),
            RouterConfig::default(),
        );
        let response = router.route("Show me all books").await;
        assert_eq!(response.kind, ResponseKind::ServerError);
        assert!(!response.success);
    }
}

use async_trait::async_trait;
use mongodb::bson::{self, doc, Bson};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{Document, DocumentError, DocumentStore};

pub const LOCAL_URI: &str = "mongodb://localhost:27017/";

/// How the startup connection to the document cluster is attempted.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Candidate URIs in priority order.
    pub uris: Vec<String>,
    /// Attempts per candidate before moving on.
    pub attempts: u32,
    pub backoff: Duration,
    pub server_selection_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            uris: vec![LOCAL_URI.to_string()],
            attempts: 2,
            backoff: Duration::from_millis(250),
            server_selection_timeout: Duration::from_secs(5),
        }
    }
}

/// The document cluster handle as seen by the rest of the crate.
///
/// Built once at startup. `Unavailable` is a normal value: every document
/// operation then reports [`DocumentError::Unavailable`].
#[derive(Clone)]
pub enum DocumentCluster {
    Connected(Arc<dyn DocumentStore>),
    Unavailable { tried: Vec<String> },
}

impl DocumentCluster {
    /// Try each candidate URI in order (with bounded retries) and keep the
    /// first one that answers a ping.
    pub async fn connect(options: &ConnectOptions) -> Self {
        let mut tried = Vec::new();

        for uri in &options.uris {
            let shown = redact_uri(uri);
            for attempt in 1..=options.attempts.max(1) {
                match MongoCluster::connect(uri, options.server_selection_timeout).await {
                    Ok(cluster) => {
                        tracing::info!(uri = %shown, attempt, "connected to document store");
                        return DocumentCluster::Connected(Arc::new(cluster));
                    }
                    Err(e) => {
                        tracing::warn!(uri = %shown, attempt, error = %e, "document store connection failed");
                        if attempt < options.attempts {
                            tokio::time::sleep(options.backoff * attempt).await;
                        }
                    }
                }
            }
            tried.push(shown);
        }

        tracing::error!(tried = ?tried, "no document store reachable");
        DocumentCluster::Unavailable { tried }
    }

    pub fn from_store(store: Arc<dyn DocumentStore>) -> Self {
        DocumentCluster::Connected(store)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, DocumentCluster::Connected(_))
    }

    pub fn store(&self) -> Result<&Arc<dyn DocumentStore>, DocumentError> {
        match self {
            DocumentCluster::Connected(store) => Ok(store),
            DocumentCluster::Unavailable { tried } => Err(DocumentError::Unavailable {
                tried: tried.clone(),
            }),
        }
    }
}

/// Hide the password part of a connection string.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or("");
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => uri.to_string(),
    }
}

/// MongoDB-backed [`DocumentStore`].
pub struct MongoCluster {
    client: Client,
}

impl MongoCluster {
    pub async fn connect(uri: &str, server_selection_timeout: Duration) -> Result<Self, DocumentError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(server_selection_timeout);
        options.connect_timeout = Some(server_selection_timeout);
        options.app_name = Some("askdb".to_string());

        let client = Client::with_options(options)?;
        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentStore for MongoCluster {
    async fn database_names(&self) -> Result<Vec<String>, DocumentError> {
        Ok(self.client.list_database_names().await?)
    }

    async fn collection_names(&self, database: &str) -> Result<Vec<String>, DocumentError> {
        Ok(self.client.database(database).list_collection_names().await?)
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: &Value,
        projection: Option<&Value>,
        limit: u32,
    ) -> Result<Vec<Document>, DocumentError> {
        let filter = to_bson_document(filter)?;
        let coll = self
            .client
            .database(database)
            .collection::<bson::Document>(collection);

        let mut find = coll.find(filter).limit(i64::from(limit));
        if let Some(projection) = projection {
            find = find.projection(to_bson_document(projection)?);
        }
        let mut cursor = find.await?;

        let mut documents = Vec::new();
        while cursor.advance().await? {
            let raw = cursor.deserialize_current()?;
            documents.push(normalize_document(raw));
        }
        Ok(documents)
    }

    async fn count(&self, database: &str, collection: &str) -> Result<Option<u64>, DocumentError> {
        let count = self
            .client
            .database(database)
            .collection::<bson::Document>(collection)
            .estimated_document_count()
            .await?;
        Ok(Some(count))
    }
}

fn to_bson_document(value: &Value) -> Result<bson::Document, DocumentError> {
    match value {
        Value::Null => Ok(bson::Document::new()),
        Value::Object(_) => {
            bson::to_document(value).map_err(|e| DocumentError::InvalidQuery(e.to_string()))
        }
        other => Err(DocumentError::InvalidQuery(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Render a driver document as JSON, with an ObjectId `_id` turned into
/// its hex string.
fn normalize_document(mut raw: bson::Document) -> Document {
    if let Some(Bson::ObjectId(oid)) = raw.get("_id") {
        let hex = oid.to_hex();
        raw.insert("_id", hex);
    }
    match Bson::Document(raw).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

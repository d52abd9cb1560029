use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{DocumentError, DocumentExecutor};

/// Fields holding large binary payloads; never shown to a generator.
pub const STRIPPED_FIELDS: &[&str] = &["data"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionSchema {
    /// Field name -> type name, from one sample document.
    pub fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// database -> collection -> schema
pub type DocumentSchema = BTreeMap<String, BTreeMap<String, CollectionSchema>>;

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Sample every collection of every non-administrative database. Databases
/// without collections are left out; a collection that cannot be sampled is
/// reported with an `error` and no fields.
pub async fn sample_schema(executor: &DocumentExecutor) -> Result<DocumentSchema, DocumentError> {
    let store = executor.cluster().store()?;
    let no_id = json!({ "_id": 0 });
    let mut schema = DocumentSchema::new();

    for database in executor.databases().await? {
        let collections = match store.collection_names(&database).await {
            Ok(collections) => collections,
            Err(e) => {
                tracing::warn!(database = %database, error = %e, "cannot list collections");
                continue;
            }
        };

        let mut db_schema = BTreeMap::new();
        for collection in collections {
            let sampled = store
                .find(&database, &collection, &Value::Null, Some(&no_id), 1)
                .await;
            let entry = match sampled {
                Ok(docs) => CollectionSchema {
                    fields: docs
                        .first()
                        .map(|doc| {
                            doc.iter()
                                .filter(|(k, _)| !STRIPPED_FIELDS.contains(&k.as_str()))
                                .map(|(k, v)| (k.clone(), type_name(v).to_string()))
                                .collect()
                        })
                        .unwrap_or_default(),
                    count: store.count(&database, &collection).await.ok().flatten(),
                    error: None,
                },
                Err(e) => CollectionSchema {
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            };
            db_schema.insert(collection, entry);
        }

        if !db_schema.is_empty() {
            schema.insert(database, db_schema);
        }
    }

    Ok(schema)
}

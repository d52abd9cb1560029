//! Combined view of both backends' schemas, used for prompts, existence
//! answers and suggestions.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::db::{merge_table_maps, RelationalExecutor, TableMap};
use crate::document::{sample_schema, CollectionSchema, DocumentExecutor, DocumentSchema};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaSnapshot {
    /// engine -> tables
    pub relational: BTreeMap<String, TableMap>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relational_errors: BTreeMap<String, String>,
    pub document: DocumentSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_error: Option<String>,
}

/// Where a named table was found.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef<'a> {
    pub engine: &'a str,
    pub table: &'a str,
    pub columns: &'a [String],
}

/// Where a named collection was found.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRef<'a> {
    pub database: &'a str,
    pub collection: &'a str,
    pub schema: &'a CollectionSchema,
}

impl SchemaSnapshot {
    /// Introspect every engine and the document cluster. Failures are kept
    /// in the snapshot instead of aborting it.
    pub async fn collect(relational: &RelationalExecutor, documents: &DocumentExecutor) -> Self {
        let mut snapshot = SchemaSnapshot::default();
        let backend = relational.backend();

        for engine in backend.engine_names() {
            match backend.tables(&engine).await {
                Ok(tables) => {
                    snapshot.relational.insert(engine, tables);
                }
                Err(e) => {
                    tracing::warn!(engine = %engine, error = %e, "relational schema unavailable");
                    snapshot.relational_errors.insert(engine, e.to_string());
                }
            }
        }

        match sample_schema(documents).await {
            Ok(schema) => snapshot.document = schema,
            Err(e) => {
                tracing::warn!(error = %e, "document schema unavailable");
                snapshot.document_error = Some(e.to_string());
            }
        }

        snapshot
    }

    pub fn merged_tables(&self) -> TableMap {
        merge_table_maps(self.relational.values())
    }

    pub fn has_relational(&self) -> bool {
        self.relational.values().any(|tables| !tables.is_empty())
    }

    pub fn has_document(&self) -> bool {
        !self.document.is_empty()
    }

    pub fn find_table(&self, name: &str) -> Option<TableRef<'_>> {
        self.relational.iter().find_map(|(engine, tables)| {
            tables
                .iter()
                .find(|(table, _)| names_match(table, name))
                .map(|(table, columns)| TableRef {
                    engine,
                    table,
                    columns,
                })
        })
    }

    pub fn find_collection(&self, name: &str) -> Option<CollectionRef<'_>> {
        self.document.iter().find_map(|(database, collections)| {
            collections
                .iter()
                .find(|(collection, _)| names_match(collection, name))
                .map(|(collection, schema)| CollectionRef {
                    database,
                    collection,
                    schema,
                })
        })
    }

    /// Prompt section describing the relational engines.
    pub fn relational_prompt(&self) -> String {
        let mut out = String::new();
        for (engine, tables) in &self.relational {
            let _ = writeln!(out, "Database `{}`:", engine);
            for (table, columns) in tables {
                let _ = writeln!(out, "  Table `{}`: {}", table, columns.join(", "));
            }
        }
        out
    }

    /// Prompt section describing the document databases.
    pub fn document_prompt(&self) -> String {
        let mut out = String::new();
        for (database, collections) in &self.document {
            let _ = writeln!(out, "Database `{}`:", database);
            for (collection, schema) in collections {
                let fields: Vec<String> = schema
                    .fields
                    .iter()
                    .map(|(field, ty)| format!("{} ({})", field, ty))
                    .collect();
                let count = schema
                    .count
                    .map(|c| format!(" [{} documents]", c))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  Collection `{}`{}: {}",
                    collection,
                    count,
                    fields.join(", ")
                );
            }
        }
        out
    }
}

/// Case-insensitive name comparison that also accepts a trailing plural `s`.
pub fn names_match(actual: &str, wanted: &str) -> bool {
    let actual = actual.to_lowercase();
    let wanted = wanted.trim().to_lowercase();
    let bare = actual.rsplit('.').next().unwrap_or(&actual);
    [actual.as_str(), bare].iter().any(|candidate| {
        *candidate == wanted
            || candidate.strip_suffix('s') == Some(wanted.as_str())
            || wanted.strip_suffix('s') == Some(*candidate)
    })
}

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

use super::{DocumentGeneration, DocumentQueryGenerator};
use crate::document::DocumentQuery;
use crate::schema::SchemaSnapshot;

/// Common words mapped to the collection they usually mean.
const TERM_COLLECTIONS: &[(&str, &str)] = &[
    ("photo", "photos"),
    ("image", "photos"),
    ("picture", "photos"),
    ("file", "files"),
    ("car", "cars"),
    ("vehicle", "cars"),
    ("product", "products"),
    ("user", "users"),
];

const NOT_A_NAME: &[&str] = &["the", "a", "an", "any", "this", "that", "my", "our", "each", "every", "which"];

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

struct Patterns {
    named_collection: Regex,
    collection_named: Regex,
    in_the_database: Regex,
    named_database: Regex,
    double_quoted: Regex,
    single_quoted: Regex,
    filename_is: Regex,
    name_is: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("static heuristic regex");
        Patterns {
            named_collection: re(r"([a-z0-9_]+)\s+collection"),
            collection_named: re(r"collection\s+([a-z0-9_]+)"),
            in_the_database: re(r"in the ([a-z0-9_]+) database"),
            named_database: re(r"([a-z0-9_]+) database"),
            double_quoted: re(r#""([^"]+)""#),
            single_quoted: re(r"'([^']+)'"),
            filename_is: re(r"(?i)filename\s+(?:is|=)\s*([a-zA-Z0-9_\-\.]+)"),
            name_is: re(r"(?i)name\s+(?:is|=)\s*([a-zA-Z0-9_\-]+)"),
        }
    })
}

/// Deterministic document-query generator that needs no network access.
///
/// It reads the collection, database and a simple equality filter straight
/// from the wording of the question.
#[derive(Debug, Default, Clone)]
pub struct HeuristicDocumentGenerator;

impl HeuristicDocumentGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, question: &str, schema: &SchemaSnapshot) -> DocumentGeneration {
        let original = question.trim();
        let lower = original.to_lowercase();

        let Some(collection) = collection_for(&lower, schema) else {
            return DocumentGeneration::Empty;
        };

        let mut query = DocumentQuery::new(collection).with_filter(Value::Object(filter_for(original, &lower)));
        query.database_name = database_for(&lower, schema);
        DocumentGeneration::Query(query)
    }
}

fn capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn usable_name(name: &str) -> bool {
    !NOT_A_NAME.contains(&name)
}

fn mentions(text: &str, word: &str) -> bool {
    let word = word.to_lowercase();
    text.match_indices(&word).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + word.len()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        boundary(before) && boundary(after)
    })
}

fn collection_for(lower: &str, schema: &SchemaSnapshot) -> Option<String> {
    let p = patterns();
    if let Some(name) = capture(&p.named_collection, lower)
        .filter(|n| usable_name(n))
        .or_else(|| capture(&p.collection_named, lower).filter(|n| usable_name(n)))
    {
        return Some(name.to_string());
    }

    let known = schema.document.values().flat_map(|collections| collections.keys());
    for collection in known {
        if mentions(lower, collection) {
            return Some(collection.clone());
        }
    }

    TERM_COLLECTIONS
        .iter()
        .find(|(term, _)| lower.contains(term))
        .map(|(_, collection)| collection.to_string())
}

fn database_for(lower: &str, schema: &SchemaSnapshot) -> Option<String> {
    let p = patterns();
    if let Some(name) = capture(&p.in_the_database, lower)
        .or_else(|| capture(&p.named_database, lower))
        .filter(|n| usable_name(n))
    {
        return Some(name.to_string());
    }

    schema
        .document
        .keys()
        .find(|database| mentions(lower, database))
        .cloned()
}

fn normalize_value(raw: &str) -> Value {
    let value = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = value.parse::<i64>() {
            return json!(n);
        }
    }
    Value::String(value.to_string())
}

fn filter_for(original: &str, lower: &str) -> Map<String, Value> {
    let p = patterns();
    let mut filter = Map::new();

    let quoted = capture(&p.double_quoted, original).or_else(|| capture(&p.single_quoted, original));
    if let Some(token) = quoted {
        let token = token.trim();
        let token_lower = token.to_lowercase();
        let is_file = lower.contains("filename")
            || lower.contains("file name")
            || IMAGE_EXTENSIONS.iter().any(|ext| token_lower.ends_with(ext));
        let field = if is_file { "filename" } else { "name" };
        filter.insert(field.to_string(), normalize_value(token));
    } else if let Some(value) = capture(&p.filename_is, original) {
        filter.insert("filename".to_string(), normalize_value(value));
    } else if let Some(value) = capture(&p.name_is, original) {
        filter.insert("name".to_string(), normalize_value(value));
    }

    filter
}

#[async_trait]
impl DocumentQueryGenerator for HeuristicDocumentGenerator {
    async fn generate_document_query(&self, question: &str, schema: &SchemaSnapshot) -> DocumentGeneration {
        self.generate(question, schema)
    }
}

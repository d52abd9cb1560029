use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::{
    parse_document_reply, parse_sql_reply, DocumentGeneration, DocumentQueryGenerator,
    GenerationError, SqlGeneration, SqlGenerator,
};
use crate::schema::SchemaSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiConfig {
    /// Taken from `GEMINI_API_KEY` when not set in the file.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

/// Generator backed by the Gemini `generateContent` API.
pub struct GeminiGenerator {
    config: GeminiConfig,
    client: Client,
}

impl GeminiGenerator {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(GenerationError::MissingApiKey)?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&json!({
                "contents": [{"parts": [{"text": prompt}]}],
                "generationConfig": {"temperature": 0.1}
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = serde_json::from_str(&body).map_err(|_| GenerationError::EmptyReply)?;
        extract_text(parsed).ok_or(GenerationError::EmptyReply)
    }
}

fn extract_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .map(|p| p.text)
        .collect();
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

pub fn sql_prompt(question: &str, schema: &SchemaSnapshot) -> String {
    let engines: Vec<&str> = schema.relational.keys().map(String::as_str).collect();
    let shape = if engines.len() > 1 {
        format!(
            "Return a JSON object whose keys are database names ({}) and whose values are \
             the SQL query for that database, or an empty string when the database cannot \
             answer the question.",
            engines.join(", ")
        )
    } else {
        "Return only the SQL query, with no explanation.".to_string()
    };

    format!(
        "You are a PostgreSQL expert. Given the database schema and a natural language question, \
         generate a safe, correct SQL SELECT query. Only use SELECT statements. Never use INSERT, \
         UPDATE, DELETE, DROP or any other statement that changes data. Only use tables and \
         columns present in the schema. If the question cannot be answered, reply with \
         ERROR: followed by the reason.\n\n\
         Schema:\n{}\n{}\n\nQuestion: {}\n",
        schema.relational_prompt(),
        shape,
        question
    )
}

pub fn document_prompt(question: &str, schema: &SchemaSnapshot) -> String {
    format!(
        "You translate questions into MongoDB find queries. Given the databases and collections \
         below, reply with a single JSON object with the keys \"db_name\" (omit when unsure), \
         \"collection\", \"filter\", \"projection\" (optional) and \"limit\" (default 50). Use \
         MongoDB operators such as $gt, $lt, $in and $regex in the filter. If no collection can \
         answer the question, reply with {{\"error\": \"<reason>\"}}.\n\n\
         Databases:\n{}\nQuestion: {}\n",
        schema.document_prompt(),
        question
    )
}

#[async_trait]
impl SqlGenerator for GeminiGenerator {
    async fn generate_sql(&self, question: &str, schema: &SchemaSnapshot) -> SqlGeneration {
        if !schema.has_relational() {
            return SqlGeneration::Failed("No relational tables are known".to_string());
        }
        match self.complete(&sql_prompt(question, schema)).await {
            Ok(reply) => {
                tracing::debug!(reply = %reply, "sql generator reply");
                parse_sql_reply(&reply)
            }
            Err(e) => {
                tracing::warn!(error = %e, "sql generation failed");
                SqlGeneration::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl DocumentQueryGenerator for GeminiGenerator {
    async fn generate_document_query(&self, question: &str, schema: &SchemaSnapshot) -> DocumentGeneration {
        if !schema.has_document() {
            return DocumentGeneration::Failed("No document collections are known".to_string());
        }
        match self.complete(&document_prompt(question, schema)).await {
            Ok(reply) => {
                tracing::debug!(reply = %reply, "document generator reply");
                parse_document_reply(&reply)
            }
            Err(e) => {
                tracing::warn!(error = %e, "document query generation failed");
                DocumentGeneration::Failed(e.to_string())
            }
        }
    }
}

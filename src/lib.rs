pub mod cache;
pub mod config;
pub mod db;
pub mod document;
pub mod export;
pub mod llm;
pub mod router;
pub mod schema;

#[cfg(test)]
pub(crate) mod testing;

//! Application configuration: a TOML file with an environment overlay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::db::EngineConfig;
use crate::document::{ConnectOptions, DatabaseOrder, DEFAULT_PREFERRED_DATABASE, LOCAL_URI};
use crate::llm::GeminiConfig;
use crate::router::RouterConfig;

/// Numbered environment variables (`DATABASE_URL_1`, `MONGODB_URI_1`, ...) go up to this.
pub const MAX_NUMBERED_ENV: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Engine '{0}' is configured more than once")]
    DuplicateEngine(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentConfig {
    /// Candidate URIs tried after the environment ones.
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_server_selection_timeout_secs")]
    pub server_selection_timeout_secs: u64,
    /// Tie-break when several databases hold the same collection.
    #[serde(default = "default_preferred_database")]
    pub preferred_database: Option<String>,
    #[serde(default)]
    pub database_order: DatabaseOrder,
    #[serde(default = "default_probe_limit")]
    pub probe_limit: u32,
}

fn default_connect_attempts() -> u32 {
    2
}

fn default_connect_backoff_ms() -> u64 {
    250
}

fn default_server_selection_timeout_secs() -> u64 {
    5
}

fn default_preferred_database() -> Option<String> {
    Some(DEFAULT_PREFERRED_DATABASE.to_string())
}

fn default_probe_limit() -> u32 {
    1
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            server_selection_timeout_secs: default_server_selection_timeout_secs(),
            preferred_database: default_preferred_database(),
            database_order: DatabaseOrder::default(),
            probe_limit: default_probe_limit(),
        }
    }
}

impl DocumentConfig {
    /// Candidate URIs in priority order, always ending with the local default.
    pub fn connect_options(&self) -> ConnectOptions {
        let mut uris: Vec<String> = Vec::new();
        for uri in self.uris.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
            if !uris.iter().any(|u| u == uri) {
                uris.push(uri.to_string());
            }
        }
        if !uris.iter().any(|u| u == LOCAL_URI) {
            uris.push(LOCAL_URI.to_string());
        }
        ConnectOptions {
            uris,
            attempts: self.connect_attempts.max(1),
            backoff: Duration::from_millis(self.connect_backoff_ms),
            server_selection_timeout: Duration::from_secs(self.server_selection_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub llm: GeminiConfig,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("askdb")
            .join("config.toml")
    }

    /// Read `path`, or the default location when `None`. A missing default
    /// file yields the default configuration; an explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };
        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse { path, source })?;
        config.check()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for engine in &self.engines {
            if !seen.insert(engine.name.as_str()) {
                return Err(ConfigError::DuplicateEngine(engine.name.clone()));
            }
        }
        Ok(())
    }

    /// Overlay process environment variables.
    pub fn apply_process_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Overlay variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if self.engines.is_empty() {
            if let Some(url) = var("DATABASE_URL") {
                let mut engine = EngineConfig::new("db1", url);
                engine.default = true;
                self.engines.push(engine);
            }
        }
        for n in 1..=MAX_NUMBERED_ENV {
            if let Some(url) = var(&format!("DATABASE_URL_{}", n)) {
                let name = format!("db{}", n);
                match self.engines.iter_mut().find(|e| e.name == name) {
                    Some(engine) => engine.url = url,
                    None => self.engines.push(EngineConfig::new(name, url)),
                }
            }
        }

        let mut uris: Vec<String> = Vec::new();
        uris.extend(var("MONGODB_URI"));
        for n in 1..=MAX_NUMBERED_ENV {
            uris.extend(var(&format!("MONGODB_URI_{}", n)));
        }
        uris.append(&mut self.document.uris);
        self.document.uris = uris;

        if self.llm.api_key.is_none() {
            self.llm.api_key = var("GEMINI_API_KEY");
        }
        if let Some(model) = var("GEMINI_MODEL") {
            self.llm.model = model;
        }
    }
}

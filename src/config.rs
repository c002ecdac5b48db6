use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::FirestoreConfig;
use crate::chat::ChatSettings;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/chat.json";
pub const DEFAULT_DATABASE_PATH: &str = "data/client.db";
/// Upper bound on the presence window; one week.
pub const MAX_PRESENCE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process collections; nothing leaves this process.
    Memory,
    Firestore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirestoreSettings {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_firestore_database")]
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub firestore: FirestoreSettings,
}

fn default_backend() -> Backend {
    Backend::Memory
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_string()
}

fn default_presence_ttl_secs() -> u64 {
    300
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_firestore_database() -> String {
    "(default)".to_string()
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            api_key: None,
            database: default_firestore_database(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_path: default_database_path(),
            presence_ttl_secs: default_presence_ttl_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            firestore: FirestoreSettings::default(),
        }
    }
}

impl AppConfig {
    /// Environment (including `.env`) wins over the file.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(project_id) = lookup("FIRESTORE_PROJECT_ID") {
            self.firestore.project_id = project_id;
            self.backend = Backend::Firestore;
        }
        if let Some(api_key) = lookup("FIRESTORE_API_KEY") {
            self.firestore.api_key = Some(api_key);
        }
        if let Some(path) = lookup("CHAT_DB_PATH") {
            self.database_path = path;
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        let ttl_secs = if self.presence_ttl_secs > MAX_PRESENCE_TTL_SECS {
            log::warn!(
                "presence_ttl_secs {} is too large; using {MAX_PRESENCE_TTL_SECS}",
                self.presence_ttl_secs
            );
            MAX_PRESENCE_TTL_SECS
        } else {
            self.presence_ttl_secs
        };
        ChatSettings {
            presence_ttl: chrono::Duration::seconds(ttl_secs as i64),
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }

    pub fn firestore_config(&self) -> Result<FirestoreConfig, ConfigError> {
        if self.firestore.project_id.is_empty() {
            return Err(ConfigError::MissingFirestoreSetting("FIRESTORE_PROJECT_ID"));
        }
        Ok(FirestoreConfig {
            project_id: self.firestore.project_id.clone(),
            api_key: self.firestore.api_key.clone(),
            database: self.firestore.database.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(100)),
        })
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

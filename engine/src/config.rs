//! Engine configuration loaded from environment variables.

use crate::{scope::new_scope_id, ScopeId};
use std::env;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum rows applied per transaction during a session.
    pub batch_size: usize,
    /// Whether column masks reported by change feeds may narrow updates.
    pub trust_column_masks: bool,
    /// This store's scope id, when fixed by the deployment.
    pub scope_id: Option<ScopeId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            trust_column_masks: true,
            scope_id: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// - `TABLESYNC_BATCH_SIZE` (default 500)
    /// - `TABLESYNC_TRUST_COLUMN_MASKS` (default true)
    /// - `TABLESYNC_SCOPE_ID` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`EngineConfig::from_env`], reading a `.env` file first if present.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let batch_size = match lookup("TABLESYNC_BATCH_SIZE") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidBatchSize(raw)),
            },
            None => defaults.batch_size,
        };

        let trust_column_masks = match lookup("TABLESYNC_TRUST_COLUMN_MASKS") {
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidBool {
                var: "TABLESYNC_TRUST_COLUMN_MASKS",
                value: raw,
            })?,
            None => defaults.trust_column_masks,
        };

        let scope_id = lookup("TABLESYNC_SCOPE_ID").filter(|s| !s.trim().is_empty());

        Ok(Self {
            batch_size,
            trust_column_masks,
            scope_id,
        })
    }

    /// The configured scope id, or a freshly generated one.
    pub fn scope_id_or_generate(&self) -> ScopeId {
        self.scope_id.clone().unwrap_or_else(new_scope_id)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid TABLESYNC_BATCH_SIZE value: {0}")]
    InvalidBatchSize(String),

    #[error("Invalid boolean for {var}: {value}")]
    InvalidBool { var: &'static str, value: String },
}

//! Secrets and connection strings from the process environment, optionally
//! backed by a dotenv file.

use std::collections::HashMap;
use std::path::Path;

use super::ConfigError;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const SNAPSHOT_SIGNING_KEY: &str = "SNAPSHOT_SIGNING_KEY";
pub const SNAPSHOT_UPLOAD_TOKEN: &str = "SNAPSHOT_UPLOAD_TOKEN";

/// Variables from the env file. The process environment wins on lookup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    file: HashMap<String, String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self::default()
    }

    /// Parse `path` without exporting anything into the process environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = dotenvy::from_path_iter(path)?.collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self { file })
    }

    pub fn var(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.file.get(key).cloned())
            .filter(|v| !v.is_empty())
    }
}

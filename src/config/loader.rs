//! Configuration file discovery
//!
//! Lookup order (first existing file wins):
//! 1. Path given on the command line
//! 2. ./.lsclient.toml (project-specific)
//! 3. $LSCLIENT_CONFIG
//! 4. ~/.config/lsclient/config.toml (user-global)
//!
//! Fields missing from the file fall back to the built-in defaults.

use crate::config::ClientConfig;
use crate::types::ClientError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PROJECT_CONFIG_FILE: &str = ".lsclient.toml";
pub const CONFIG_ENV_VAR: &str = "LSCLIENT_CONFIG";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the first configuration file found, or the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<ClientConfig, ClientError> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ClientError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            return Self::from_file(path);
        }

        for path in Self::candidates() {
            if path.is_file() {
                return Self::from_file(&path);
            }
        }

        debug!("No config file found, using defaults");
        let config = ClientConfig::default();
        config.validate()?;
        Ok(config)
    }

    fn candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(PROJECT_CONFIG_FILE));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            candidates.push(PathBuf::from(config_path));
        }

        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("lsclient").join("config.toml"));
        }

        candidates
    }

    pub fn from_file(path: &Path) -> Result<ClientConfig, ClientError> {
        info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ClientConfig, ClientError> {
        let config: ClientConfig = toml::from_str(content)
            .map_err(|e| ClientError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

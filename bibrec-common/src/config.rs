//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from a TOML file; everything in it has a
//! built-in default, so a missing file is a warning and never a failure.
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable `BIBREC_ROOT_FOLDER`
//! 3. TOML config file `root_folder`
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "BIBREC_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "bibrec.db";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder holding the database (optional)
    pub root_folder: Option<PathBuf>,

    /// Explicit database path; overrides `<root_folder>/bibrec.db`
    pub database_path: Option<PathBuf>,

    pub logging: LoggingConfig,
    pub migrator: MigratorConfig,
    pub records: RecordsConfig,
    pub citations: CitationsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Migration run tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Raw records per chunk when migrating a file
    pub chunk_size: usize,
    /// Mirror rows per chunk when re-driving the mirror
    pub mirror_chunk_size: usize,
    /// Chunks processed concurrently
    pub workers: usize,
    /// Attempts per record before an optimistic-concurrency conflict is final
    pub max_conflict_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Marks the environment as not production-safe; migrations refuse to
    /// run unless forced
    pub debug: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            mirror_chunk_size: 1000,
            workers: 4,
            max_conflict_retries: 5,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 1000,
            debug: false,
        }
    }
}

/// Record URL settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    /// Base URL used to build `$schema` and `$ref` values
    pub base_url: String,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
        }
    }
}

/// What a superseded (deleted-with-redirect) citing record contributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersededCiting {
    /// Its references are ignored
    #[default]
    Exclude,
    /// Its references count as if made by its final live successor
    AttributeToSuccessor,
}

/// Citation aggregation tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationsConfig {
    pub scan_page_size: usize,
    pub bulk_batch_size: usize,
    pub superseded_citing: SupersededCiting,
}

impl Default for CitationsConfig {
    fn default() -> Self {
        Self {
            scan_page_size: 1000,
            bulk_batch_size: 500,
            superseded_citing: SupersededCiting::Exclude,
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration
    ///
    /// An explicit path must exist. Without one, the platform config file is
    /// used when present; otherwise built-in defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => match default_config_path() {
                Some(path) => path,
                None => {
                    warn!("No config file found, using built-in defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.migrator.chunk_size == 0 || self.migrator.mirror_chunk_size == 0 {
            return Err(Error::Config("chunk sizes must be at least 1".to_string()));
        }
        if self.migrator.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.migrator.max_conflict_retries == 0 {
            return Err(Error::Config(
                "max_conflict_retries must be at least 1".to_string(),
            ));
        }
        if self.citations.scan_page_size == 0 || self.citations.bulk_batch_size == 0 {
            return Err(Error::Config(
                "citation page and batch sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Platform config file location, if one exists
///
/// Linux: `~/.config/bibrec/config.toml`, then `/etc/bibrec/config.toml`.
/// Elsewhere: `<config_dir>/bibrec/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("bibrec").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/bibrec/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bibrec"))
        .unwrap_or_else(|| PathBuf::from("./bibrec_data"))
}

/// Resolves the root folder following the documented priority order
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(cli_arg: Option<PathBuf>, config: &TomlConfig) -> Self {
        Self {
            cli_arg,
            toml_root: config.root_folder.clone(),
        }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_root {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Creates the root folder and locates the database inside it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    /// Database path, honoring an explicit override from the config
    pub fn database_path(&self, config: &TomlConfig) -> PathBuf {
        config
            .database_path
            .clone()
            .unwrap_or_else(|| self.root_folder.join(DATABASE_FILE_NAME))
    }
}

//! Configuration management for cloudraid

use crate::erasure::{CodingMethod, CodingScheme, DEFAULT_WINDOW_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Erasure coding parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Coding method
    #[serde(default)]
    pub method: CodingMethod,

    /// Number of data fragments (k)
    pub data_fragments: usize,

    /// Number of coding fragments (m)
    pub coding_fragments: usize,

    /// Galois field word size (w)
    pub word_size: usize,

    /// Packet size in bytes (bit-matrix methods only)
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
}

fn default_packet_size() -> usize {
    1024
}

impl Default for ErasureConfig {
    fn default() -> Self {
        ErasureConfig {
            method: CodingMethod::Cauchy,
            data_fragments: 6,
            coding_fragments: 2,
            word_size: 8,
            packet_size: default_packet_size(),
        }
    }
}

impl ErasureConfig {
    /// Total fragments per object (k + m)
    pub fn total_fragments(&self) -> usize {
        self.data_fragments + self.coding_fragments
    }
}

/// Streaming codec settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Bytes of object data coded per window
    pub window_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the upload record database
    pub metadata_path: PathBuf,

    /// Maximum fragment transfers in flight per store
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Placements an upload needs to succeed; defaults to k + m
    #[serde(default)]
    pub required_placements: Option<usize>,

    /// Verify fragment checksums on download
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,

    /// Directory for fragment spool files; system temp dir when unset
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_max_concurrent_transfers() -> usize {
    16
}

fn default_verify_checksums() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            metadata_path: PathBuf::from("cloudraid.db"),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            required_placements: None,
            verify_checksums: default_verify_checksums(),
            spool_dir: None,
        }
    }
}

/// One configured backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend identity, recorded in fragment metadata
    pub id: String,

    #[serde(flatten)]
    pub kind: BackendKind,
}

/// Backend implementations available from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process store
    Memory { capacity: u64 },
    /// Directory on the local filesystem
    Local { path: PathBuf, max_size: u64 },
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Colored output
    #[serde(default)]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            ansi: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub erasure: ErasureConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment
    /// variable substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content)?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Substitute `${VAR_NAME}` with the variable's value; unset variables
    /// are left as written
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| Error::Internal(format!("Invalid substitution pattern: {}", e)))?;

        let result = re.replace_all(content, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        });
        Ok(result.into_owned())
    }

    /// Apply `CLOUDRAID_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(k) = env_parse::<usize>("CLOUDRAID_DATA_FRAGMENTS") {
            self.erasure.data_fragments = k;
        }
        if let Some(m) = env_parse::<usize>("CLOUDRAID_CODING_FRAGMENTS") {
            self.erasure.coding_fragments = m;
        }
        if let Some(window) = env_parse::<usize>("CLOUDRAID_WINDOW_SIZE") {
            self.codec.window_size = window;
        }
        if let Some(limit) = env_parse::<usize>("CLOUDRAID_MAX_CONCURRENT_TRANSFERS") {
            self.store.max_concurrent_transfers = limit;
        }
        if let Ok(path) = std::env::var("CLOUDRAID_METADATA_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                self.store.metadata_path = PathBuf::from(path);
            }
        }
        if let Ok(dir) = std::env::var("CLOUDRAID_SPOOL_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.store.spool_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(level) = std::env::var("CLOUDRAID_LOG_LEVEL") {
            let level = level.trim();
            if !level.is_empty() {
                self.logging.level = level.to_string();
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Placements an upload needs, after applying the default
    pub fn required_placements(&self) -> usize {
        self.store
            .required_placements
            .unwrap_or_else(|| self.erasure.total_fragments())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Coding parameters are checked by building the scheme once
        CodingScheme::from_config(&self.erasure)?;

        if self.codec.window_size == 0 {
            return Err(Error::InvalidConfig(
                "Window size must be greater than 0".to_string(),
            ));
        }

        if self.store.max_concurrent_transfers == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_transfers must be greater than 0".to_string(),
            ));
        }

        let k = self.erasure.data_fragments;
        let total = self.erasure.total_fragments();
        let required = self.required_placements();
        if required < k || required > total {
            return Err(Error::InvalidConfig(format!(
                "required_placements must be between {} and {}, got {}",
                k, total, required
            )));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(Error::InvalidConfig("Backend id cannot be empty".to_string()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate backend id: {}",
                    backend.id
                )));
            }
        }

        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

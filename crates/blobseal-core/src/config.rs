use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BlobsealError, BlobsealResult};

/// Top-level configuration (loaded from blobseal.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobsealConfig {
    pub repository: RepositoryConfig,
    pub crypto: CryptoConfig,
    pub log: LogConfig,
}

impl BlobsealConfig {
    /// Load the configuration file, or the defaults if it does not exist.
    pub fn load(path: &Path) -> BlobsealResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| BlobsealError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository name; seeds the KDF salt when `crypto.kdf_salt` is unset
    pub name: String,
    /// Root directory of the filesystem blob store
    pub path: PathBuf,
    /// Container path inside the store under which blobs are written
    pub base_path: String,
    /// Path segment that prefixes every metadata blob path
    pub metadata_prefix: String,
    /// Plaintext packet length in bytes (default: 65536)
    pub packet_length: u32,
}

/// Repository encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Environment variable holding the repository password
    pub password_env: String,
    /// Base64 16-byte KDF salt (default: derived from the repository name)
    pub kdf_salt: Option<String>,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            path: PathBuf::from("./blobseal-repository"),
            base_path: String::new(),
            metadata_prefix: "encryption-metadata".into(),
            packet_length: 64 * 1024,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            password_env: "BLOBSEAL_PASSWORD".into(),
            kdf_salt: None,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

use crate::recorder::BoundaryConfig;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable through which AFL-style fuzzers publish the coverage segment.
pub const DEFAULT_SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// FIFO the controller listens on for synchronization bytes.
pub const DEFAULT_SYNC_PIPE: &str = "afl_sync";
/// Section the toolchain emits application machine code into.
pub const DEFAULT_CODE_SECTION: &str = ".text";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Empty block id")]
    EmptyBlockId,
    #[error("Invalid block id '{0}': expected decimal or 0x-prefixed hex")]
    InvalidBlockId(String),
}

/// Parses a block id given either as decimal or `0x`-prefixed hexadecimal.
pub fn parse_block_id(text: &str) -> Result<u64, ConfigError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBlockId);
    }
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| ConfigError::InvalidBlockId(trimmed.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBlockId {
    Int(u64),
    Text(String),
}

fn deserialize_block_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawBlockId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawBlockId::Int(value)) => Ok(Some(value)),
        Some(RawBlockId::Text(text)) => parse_block_id(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn default_shm_env_var() -> String {
    DEFAULT_SHM_ENV_VAR.to_string()
}

pub fn default_sync_pipe() -> PathBuf {
    PathBuf::from(DEFAULT_SYNC_PIPE)
}

fn default_code_section() -> String {
    DEFAULT_CODE_SECTION.to_string()
}

/// Startup options of the bridge. Read once, immutable for the rest of the run.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default, deserialize_with = "deserialize_block_id")]
    pub entry: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_block_id")]
    pub exit: Option<u64>,
    #[serde(default = "default_shm_env_var")]
    pub shm_env_var: String,
    #[serde(default = "default_sync_pipe")]
    pub sync_pipe: PathBuf,
    #[serde(default = "default_code_section")]
    pub code_section: String,
}

impl BridgeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Entry/exit ids as the recorder sees them. An id of 0 counts as unset.
    pub fn boundaries(&self) -> BoundaryConfig {
        BoundaryConfig::new(self.entry, self.exit)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            entry: None,
            exit: None,
            shm_env_var: default_shm_env_var(),
            sync_pipe: default_sync_pipe(),
            code_section: default_code_section(),
        }
    }
}

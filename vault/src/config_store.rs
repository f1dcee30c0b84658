use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use bitcoin::Network;
use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{VaultError, VaultResult};
use crate::storage::{KdfCost, VaultPaths};

const CONFIG_VERSION: u16 = 1;
const DEFAULT_RPC_ENDPOINT: &str = "http://127.0.0.1:61399";
const DEFAULT_LOOKUP_DEPTH: u8 = 20;

pub const ENV_NETWORK: &str = "CITADEL_NETWORK";
pub const ENV_RPC_ENDPOINT: &str = "CITADEL_RPC_ENDPOINT";
pub const ENV_LOOKUP_DEPTH: &str = "CITADEL_LOOKUP_DEPTH";
pub const ENV_RESCAN: &str = "CITADEL_RESCAN";
pub const ENV_SIGNING_MODE: &str = "CITADEL_SIGNING_MODE";

/// Who signs transfers during payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningMode {
    /// The engine signs with keys it holds.
    #[default]
    Remote,
    /// The vault signer signs with the contract's scoped key.
    Local,
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningMode::Remote => f.write_str("remote"),
            SigningMode::Local => f.write_str("local"),
        }
    }
}

impl FromStr for SigningMode {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(SigningMode::Remote),
            "local" => Ok(SigningMode::Local),
            other => Err(VaultError::Validation(format!(
                "Unknown signing mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    pub network: Network,
    pub rpc_endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            rpc_endpoint: DEFAULT_RPC_ENDPOINT.to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    pub rescan: bool,
    pub lookup_depth: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rescan: false,
            lookup_depth: DEFAULT_LOOKUP_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageConfig {
    pub kdf: KdfCost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultConfig {
    pub chain: ChainConfig,
    pub sync: SyncConfig,
    pub signing: SigningMode,
    pub storage: StorageConfig,
    pub environment: String,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl VaultConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            chain: ChainConfig::default(),
            sync: SyncConfig::default(),
            signing: SigningMode::default(),
            storage: StorageConfig::default(),
            environment: environment.into(),
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> VaultResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Empty values and values carrying
    /// control characters are skipped with a warning; malformed values are
    /// an error.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> VaultResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = [
            ENV_NETWORK,
            ENV_RPC_ENDPOINT,
            ENV_LOOKUP_DEPTH,
            ENV_RESCAN,
            ENV_SIGNING_MODE,
        ];

        for env_var in vars {
            let Some(value) = lookup(env_var) else {
                continue;
            };
            if value.trim().is_empty() {
                log::warn!("Environment variable {} is empty", env_var);
                continue;
            }
            if value.chars().any(|c| c.is_control()) {
                log::warn!(
                    "Environment variable {} contains control characters, ignoring",
                    env_var
                );
                continue;
            }

            let value = value.trim();
            match env_var {
                ENV_NETWORK => {
                    self.chain.network = Network::from_str(value).map_err(|_| {
                        VaultError::Validation(format!("Unknown network '{}'", value))
                    })?
                }
                ENV_RPC_ENDPOINT => self.chain.rpc_endpoint = value.to_string(),
                ENV_LOOKUP_DEPTH => self.sync.lookup_depth = parse_u8_value(value, env_var)?,
                ENV_RESCAN => self.sync.rescan = parse_bool_flag(value, env_var)?,
                ENV_SIGNING_MODE => self.signing = value.parse()?,
                _ => continue,
            }
            log::debug!("Loaded configuration from environment variable {}", env_var);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: VaultConfig,
    modified_at_unix: i64,
}

/// Handles persistence of vault configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_paths(paths: &VaultPaths) -> Self {
        Self {
            path: paths.config_file().to_path_buf(),
        }
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_or_default(&self, environment: impl Into<String>) -> VaultResult<VaultConfig> {
        if !self.path.exists() {
            let config = VaultConfig::new(environment);
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != CONFIG_VERSION {
            return Err(VaultError::Validation(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(VaultError::Validation(
                "Config integrity verification failed".to_string(),
            ));
        }

        Ok(envelope.payload)
    }

    pub fn save(&self, config: &VaultConfig) -> VaultResult<()> {
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_err(|e| VaultError::Storage(e.to_string()))?
                .as_secs() as i64,
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        let tmp_path = self.path.with_extension("new");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    pub fn update<F>(&self, environment: impl Into<String>, updater: F) -> VaultResult<VaultConfig>
    where
        F: FnOnce(&mut VaultConfig) -> VaultResult<()>,
    {
        let mut config = self.load_or_default(environment)?;
        updater(&mut config)?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &VaultConfig) -> VaultResult<[u8; 32]> {
    let mut hasher = Blake3::new();
    hasher.update(&serde_json::to_vec(config)?);
    Ok(*hasher.finalize().as_bytes())
}

fn parse_bool_flag(value: &str, key: &str) -> VaultResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(VaultError::Validation(format!(
            "Invalid boolean value '{}' for key '{}'",
            value, key
        ))),
    }
}

fn parse_u8_value(value: &str, key: &str) -> VaultResult<u8> {
    value.trim().parse::<u8>().map_err(|_| {
        VaultError::Validation(format!(
            "Invalid numeric value '{}' for key '{}'",
            value, key
        ))
    })
}

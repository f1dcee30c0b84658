use std::path::PathBuf;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, MutexGuard};

use crate::config_store::{ConfigStore, VaultConfig};
use crate::errors::VaultResult;
use crate::remote::{JsonRpcEngine, RemoteEngine};
use crate::storage::{FileSecretStore, VaultPaths};
use crate::validation::InputValidator;
use crate::vault::Vault;

pub const ENV_ENVIRONMENT: &str = "CITADEL_ENV";

/// Vault handle for callers on several tasks. The lock provides the one
/// call in flight at a time that vault mutations rely on.
#[derive(Clone)]
pub struct SharedVault(Arc<Mutex<Vault>>);

impl SharedVault {
    pub fn new(vault: Vault) -> Self {
        Self(Arc::new(Mutex::new(vault)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, Vault> {
        self.0.lock().await
    }
}

/// Wires paths, configuration, the file-backed secret store and the vault.
pub struct VaultContext {
    paths: VaultPaths,
    config_store: ConfigStore,
    config: VaultConfig,
    environment: String,
    vault: SharedVault,
}

impl VaultContext {
    /// Open the vault under `root_dir`, talking to the engine named in the
    /// configuration.
    pub fn initialize(root_dir: PathBuf, password: &SecretString) -> VaultResult<Self> {
        Self::initialize_with(root_dir, password, |config| {
            let engine =
                JsonRpcEngine::new(&config.chain.rpc_endpoint, config.chain.request_timeout())?;
            Ok(Arc::new(engine) as Arc<dyn RemoteEngine>)
        })
    }

    /// Same as [`VaultContext::initialize`] with a caller-built engine.
    pub fn initialize_with<F>(
        root_dir: PathBuf,
        password: &SecretString,
        make_engine: F,
    ) -> VaultResult<Self>
    where
        F: FnOnce(&VaultConfig) -> VaultResult<Arc<dyn RemoteEngine>>,
    {
        let environment =
            std::env::var(ENV_ENVIRONMENT).unwrap_or_else(|_| "development".to_string());
        InputValidator::new()?.validate_password(password.expose_secret())?;

        let paths = VaultPaths::new(&root_dir)?;
        paths.ensure_directories()?;

        let config_store = ConfigStore::from_paths(&paths);
        let mut config = config_store.load_or_default(environment.clone())?;
        config.apply_env_overrides()?;

        let store = FileSecretStore::open_with_cost(&paths, password, config.storage.kdf)?;
        let engine = make_engine(&config)?;
        let vault = Vault::open(&config, Arc::new(store), engine)?;

        Ok(Self {
            paths,
            config_store,
            config,
            environment,
            vault: SharedVault::new(vault),
        })
    }

    pub fn vault(&self) -> &SharedVault {
        &self.vault
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config_store
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Persist a configuration change. Chain and signing changes apply the
    /// next time the vault is opened.
    pub fn update_config<F>(&mut self, updater: F) -> VaultResult<&VaultConfig>
    where
        F: FnOnce(&mut VaultConfig) -> VaultResult<()>,
    {
        self.config = self.config_store.update(self.environment.clone(), updater)?;
        Ok(&self.config)
    }
}

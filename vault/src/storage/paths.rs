use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{VaultError, VaultResult};

/// Manages filesystem paths used by the vault backend.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    /// Root directory for vault data.
    root_dir: PathBuf,
    /// Directory holding one encrypted file per secret entry.
    secrets_dir: PathBuf,
    /// Path to persisted vault configuration.
    config_file: PathBuf,
    /// Lease marker preventing two vault instances over the same secrets.
    lock_file: PathBuf,
}

impl VaultPaths {
    pub const SECRETS_DIRNAME: &'static str = "secrets";
    pub const CONFIG_FILENAME: &'static str = "vault.config";
    pub const LOCK_FILENAME: &'static str = "vault.lock";

    /// Create a new path manager rooted at the provided directory.
    pub fn new(root: impl AsRef<Path>) -> VaultResult<Self> {
        let root_dir = root.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(VaultError::Storage(
                "Vault root directory cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            secrets_dir: root_dir.join(Self::SECRETS_DIRNAME),
            config_file: root_dir.join(Self::CONFIG_FILENAME),
            lock_file: root_dir.join(Self::LOCK_FILENAME),
            root_dir,
        })
    }

    /// Ensure the directory structure exists, creating missing folders.
    pub fn ensure_directories(&self) -> VaultResult<()> {
        fs::create_dir_all(&self.root_dir)?;
        fs::create_dir_all(&self.secrets_dir)?;
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Location of the encrypted file backing a secret entry.
    ///
    /// Entry names are hashed so descriptors never appear in directory listings.
    pub fn secret_file(&self, key: &str) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.secrets_dir
            .join(format!("{}.secret", digest.to_hex()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vault_paths_creation() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::new(temp_dir.path()).unwrap();

        assert_eq!(paths.secrets_dir(), temp_dir.path().join("secrets"));
        assert_eq!(paths.config_file(), temp_dir.path().join("vault.config"));
        assert_eq!(paths.lock_file(), temp_dir.path().join("vault.lock"));
    }

    #[test]
    fn test_empty_root_directory_rejected() {
        let result = VaultPaths::new("");
        match result {
            Err(VaultError::Storage(msg)) => {
                assert!(msg.contains("cannot be empty"));
            }
            _ => panic!("Expected Storage error for empty root"),
        }
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::new(temp_dir.path().join("nested")).unwrap();

        paths.ensure_directories().unwrap();

        assert!(paths.root_dir().exists());
        assert!(paths.secrets_dir().exists());
    }

    #[test]
    fn test_secret_file_names_are_stable_and_opaque() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::new(temp_dir.path()).unwrap();

        let descriptor = "[0badc0de/84'/1'/7']tpubD6NzVbkrYhZ4X/0/*";
        let first = paths.secret_file(descriptor);
        assert_eq!(first, paths.secret_file(descriptor));
        assert_ne!(first, paths.secret_file("citadel.seed"));

        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(".secret"));
        assert!(!name.contains("tpub"));
    }
}

use thiserror::Error;

use crate::parser::ParseError;
use crate::storage::{StoreOperation, StoreStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    // Key custody errors
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Master key is not present in the secret store")]
    MissingMasterKey,
    #[error("Secure storage {operation} failed: {status}")]
    SecureStorage {
        operation: StoreOperation,
        status: StoreStatus,
    },
    #[error("Signing failed: {0}")]
    Signing(String),

    // Ledger errors
    #[error("Asset {asset_id} is referenced by a balance but not known locally")]
    InternalConsistency { asset_id: String },
    #[error("Contract {0} not found")]
    ContractNotFound(String),

    // Remote engine errors
    #[error("Remote call {method} returned neither result nor error: API contract broken")]
    RemoteProtocol { method: String },
    #[error("Remote error {code}: {message}")]
    RemoteReported { code: i64, message: String },
    #[error("Network error: {0}")]
    Network(String),

    // Input errors
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Validation error: {0}")]
    Validation(String),

    // Application errors
    #[error("Vault is already running for namespace {0}")]
    AlreadyRunning(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    pub fn storage(operation: StoreOperation, status: StoreStatus) -> Self {
        VaultError::SecureStorage { operation, status }
    }

    /// Whether the error originates from the remote engine rather than local state.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            VaultError::RemoteProtocol { .. }
                | VaultError::RemoteReported { .. }
                | VaultError::Network(_)
        )
    }
}

// Conversion helpers
impl From<std::io::Error> for VaultError {
    fn from(error: std::io::Error) -> Self {
        VaultError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(error: serde_json::Error) -> Self {
        VaultError::Serialization(format!("JSON error: {}", error))
    }
}

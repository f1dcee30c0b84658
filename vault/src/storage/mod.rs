pub mod file_store;
pub mod paths;
pub mod secret_store;

pub use file_store::{FileSecretStore, KdfCost};
pub use paths::VaultPaths;
pub use secret_store::{
    MemorySecretStore, SecretStore, StoreLease, StoreOperation, StoreStatus,
};

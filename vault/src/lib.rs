// lib.rs - Core library structure for the vault

pub mod api;
pub mod app_state;
pub mod asset;
pub mod config_store;
pub mod derivation;
pub mod errors;
pub mod model;
pub mod notify;
pub mod parser;
pub mod remote;
pub mod signer;
pub mod storage;
pub mod validation;
pub mod vault;
pub mod wallet;

// Re-export common types
pub use api::types::*;
pub use app_state::{SharedVault, VaultContext};
pub use asset::{
    Asset, AssetRegistry, AssetSyncReport, Authenticity, DecimalAmount, Fungible, NativeAsset,
    Precision, SupplyMetrics, TokenAsset,
};
pub use config_store::{ChainConfig, ConfigStore, SigningMode, SyncConfig, VaultConfig};
pub use derivation::{DescriptorCategory, KeyOrigin, PathPolicy, ScopedPath};
pub use errors::{VaultError, VaultResult};
pub use model::{Allocation, Balance, ChainSnapshot, Contract, Ledger};
pub use notify::{EventBus, VaultEvent};
pub use parser::{EncodingFamily, ParseError, ParseErrorKind, ParsedEntity, UniversalParser};
pub use remote::{JsonRpcEngine, RemoteEngine};
pub use signer::{SeedOutcome, Signer};
pub use storage::{FileSecretStore, KdfCost, MemorySecretStore, SecretStore, VaultPaths};
pub use validation::InputValidator;
pub use vault::{PaymentResult, SyncReport, Vault, VaultSnapshot};
pub use wallet::WalletContract;

//! The vault: single source of truth for contracts, assets, balances and
//! chain snapshots, orchestrating synchronisation and payments against the
//! remote engine.
//!
//! Mutating operations take `&mut self`, so one owner serialises them.
//! Share a vault across tasks through [`crate::app_state::SharedVault`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::Network;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::api::types::{
    Acknowledgement, AddressRecord, ConsignmentStatus, InvoiceRequest, OperationRecord, PayRequest,
};
use crate::asset::{Asset, AssetRegistry, AssetSyncReport, Fungible, TokenAsset};
use crate::config_store::{SigningMode, SyncConfig, VaultConfig};
use crate::derivation::{DescriptorCategory, PathPolicy};
use crate::errors::{VaultError, VaultResult};
use crate::model::{Allocation, Balance, ChainSnapshot, Contract, Ledger};
use crate::notify::{EventBus, VaultEvent};
use crate::parser::{ParseError, ParsedEntity, UniversalParser};
use crate::remote::RemoteEngine;
use crate::signer::{SeedOutcome, Signer};
use crate::storage::{SecretStore, StoreLease, StoreOperation, StoreStatus};
use crate::validation::InputValidator;
use crate::wallet::WalletContract;

/// Outcome of a completed payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentResult {
    pub txid: String,
    /// Signed PSBT as published.
    pub psbt: String,
    pub consignment: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub assets: AssetSyncReport,
    pub contracts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractSnapshot {
    pub contract: Contract,
    pub balances: Vec<Balance>,
}

/// Point-in-time copy of everything the vault knows, for polling consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultSnapshot {
    pub network: Network,
    pub contracts: Vec<ContractSnapshot>,
    pub assets: Vec<Asset>,
    pub chain: ChainSnapshot,
    pub taken_at: DateTime<Utc>,
}

pub struct Vault {
    network: Network,
    sync: SyncConfig,
    signing: SigningMode,
    signer: Signer,
    engine: Arc<dyn RemoteEngine>,
    validator: InputValidator,
    seed_outcome: SeedOutcome,
    contracts: Vec<Contract>,
    ledgers: HashMap<String, Ledger>,
    assets: AssetRegistry,
    chain: ChainSnapshot,
    events: EventBus,
    _lease: StoreLease,
}

impl Vault {
    /// Take exclusive ownership of the store namespace and make sure the
    /// seed and master key exist.
    pub fn open(
        config: &VaultConfig,
        store: Arc<dyn SecretStore>,
        engine: Arc<dyn RemoteEngine>,
    ) -> VaultResult<Self> {
        let namespace = store.namespace().to_string();
        let lease = store.acquire().map_err(|status| match status {
            StoreStatus::Busy => VaultError::AlreadyRunning(namespace.clone()),
            other => VaultError::storage(StoreOperation::Acquire, other),
        })?;

        let network = config.chain.network;
        let signer = Signer::new(store, network);
        let seed_outcome = signer.ensure_seed()?;
        log::info!(
            "Opened vault {} on {} (seed {:?}, signing {})",
            namespace,
            network,
            seed_outcome,
            config.signing
        );

        Ok(Self {
            network,
            sync: config.sync.clone(),
            signing: config.signing,
            signer,
            engine,
            validator: InputValidator::new()?,
            seed_outcome,
            contracts: Vec::new(),
            ledgers: HashMap::new(),
            assets: AssetRegistry::new(network),
            chain: ChainSnapshot::default(),
            events: EventBus::new(),
            _lease: lease,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn signing_mode(&self) -> SigningMode {
        self.signing
    }

    pub fn seed_outcome(&self) -> SeedOutcome {
        self.seed_outcome
    }

    pub fn assets(&self) -> &AssetRegistry {
        &self.assets
    }

    pub fn chain(&self) -> &ChainSnapshot {
        &self.chain
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    pub fn contract(&self, contract_id: &str) -> Option<WalletContract<'_>> {
        self.contracts
            .iter()
            .find(|contract| contract.id() == contract_id)
            .map(|contract| self.view(contract))
    }

    pub fn contracts(&self) -> Vec<WalletContract<'_>> {
        self.contracts.iter().map(|contract| self.view(contract)).collect()
    }

    /// Classify `input` in the context of the vault's network and assets.
    pub fn parse(&self, input: &str) -> Result<ParsedEntity, ParseError> {
        UniversalParser::new(&self.assets).parse(input)
    }

    /// Assets first, then contracts, so every balance can be resolved.
    /// Progress of the asset phase is kept if the contract phase fails.
    pub async fn sync_all(&mut self) -> VaultResult<SyncReport> {
        let assets = self.sync_assets().await?;
        let contracts = self.sync_contracts().await?;
        Ok(SyncReport { assets, contracts })
    }

    pub async fn sync_assets(&mut self) -> VaultResult<AssetSyncReport> {
        let records = self.engine.asset_list().await?;
        let report = self.assets.apply_remote(records)?;
        log::info!(
            "Asset sync: {} updated, {} new, {} total",
            report.updated,
            report.inserted,
            self.assets.len()
        );
        self.events.publish(VaultEvent::AssetsSynced {
            updated: report.updated,
            inserted: report.inserted,
        });
        Ok(report)
    }

    /// Replace the contract list, then replace each contract's allocations
    /// with its latest balance snapshot. A snapshot naming an unknown asset
    /// fails the pass before anything of that contract is attached; the
    /// failing contract and those after it are left without a ledger.
    pub async fn sync_contracts(&mut self) -> VaultResult<usize> {
        let records = self.engine.contract_list().await?;
        self.contracts = records.into_iter().map(Contract::from).collect();

        let live: HashSet<&str> = self.contracts.iter().map(Contract::id).collect();
        self.ledgers.retain(|id, _| live.contains(id.as_str()));

        let ids: Vec<String> = self
            .contracts
            .iter()
            .map(|contract| contract.id().to_string())
            .collect();
        for (position, contract_id) in ids.iter().enumerate() {
            if let Err(err) = self.refresh_ledger(contract_id).await {
                for stale in &ids[position..] {
                    self.ledgers.remove(stale);
                }
                return Err(err);
            }
        }

        log::info!("Contract sync: {} contracts", ids.len());
        self.events.publish(VaultEvent::ContractsSynced {
            contracts: ids.len(),
        });
        Ok(ids.len())
    }

    /// Refresh blockchain and mempool figures and the native supply derived
    /// from them.
    pub async fn sync_chain(&mut self) -> VaultResult<&ChainSnapshot> {
        let state = self.engine.blockchain_state().await?;
        let mempool = self.engine.mempool_state().await?;

        self.assets.update_native_supply(Some(state.height));
        let height = state.height;
        self.chain = ChainSnapshot {
            state: Some(state),
            mempool: Some(mempool),
            updated_at: Some(Utc::now()),
        };
        log::debug!("Chain snapshot at height {}", height);
        self.events.publish(VaultEvent::ChainUpdated { height });
        Ok(&self.chain)
    }

    /// Provision a scoped key and register a single-sig contract for it.
    /// Local state changes only once the engine has accepted the contract.
    pub async fn create_contract(
        &mut self,
        name: &str,
        category: DescriptorCategory,
        token_enabled: bool,
    ) -> VaultResult<Contract> {
        self.validator.validate_contract_name(name)?;
        let policy = PathPolicy::single_sig(category, token_enabled, self.network);
        let (path, descriptor) = self.signer.provision_scoped_key(&policy)?;
        log::info!("Provisioned {} key at {} for contract '{}'", category, path, name.trim());

        let record = self
            .engine
            .single_sig_create(name.trim(), &descriptor, category)
            .await
            .map_err(|err| {
                log::warn!("Engine rejected contract for {}: {}", path, err);
                err
            })?;

        let contract = Contract::from(record);
        if contract.network() != self.network {
            log::warn!(
                "Engine created contract {} on {} while the vault runs on {}",
                contract.id(),
                contract.network(),
                self.network
            );
        }
        self.ledgers.insert(contract.id().to_string(), Ledger::new());
        self.contracts.push(contract.clone());
        self.events.publish(VaultEvent::ContractCreated {
            contract_id: contract.id().to_string(),
        });
        Ok(contract)
    }

    pub async fn rename_contract(&mut self, contract_id: &str, name: &str) -> VaultResult<()> {
        self.validator.validate_contract_name(name)?;
        self.require_contract(contract_id)?;

        let ack = self.engine.contract_rename(contract_id, name.trim()).await?;
        acknowledged("contract.rename", ack)?;

        if let Some(contract) = self.contracts.iter_mut().find(|c| c.id() == contract_id) {
            contract.set_name(name.trim());
        }
        self.events.publish(VaultEvent::ContractRenamed {
            contract_id: contract_id.to_string(),
            name: name.trim().to_string(),
        });
        Ok(())
    }

    /// Remove a contract. Its scoped key stays in the secret store.
    pub async fn delete_contract(&mut self, contract_id: &str) -> VaultResult<()> {
        self.require_contract(contract_id)?;

        let ack = self.engine.contract_delete(contract_id).await?;
        acknowledged("contract.delete", ack)?;

        self.contracts.retain(|contract| contract.id() != contract_id);
        self.ledgers.remove(contract_id);
        self.events.publish(VaultEvent::ContractRemoved {
            contract_id: contract_id.to_string(),
        });
        Ok(())
    }

    pub async fn import_asset(&mut self, genesis: &str) -> VaultResult<TokenAsset> {
        self.validator.validate_encoded("Genesis", genesis)?;
        let record = self.engine.asset_import(genesis.trim()).await?;
        let token = TokenAsset::from_record(record)?;
        self.assets.insert_token(token.clone())?;

        log::info!("Imported asset {} ({})", token.ticker(), token.id());
        self.events.publish(VaultEvent::AssetImported {
            asset_id: token.id().to_string(),
        });
        Ok(token)
    }

    pub async fn addresses(&self, contract_id: &str, legacy: bool) -> VaultResult<Vec<AddressRecord>> {
        self.require_contract(contract_id)?;
        self.engine.address_list(contract_id, legacy).await
    }

    pub async fn next_address(&mut self, contract_id: &str, legacy: bool) -> VaultResult<AddressRecord> {
        self.require_contract(contract_id)?;
        self.engine.address_create(contract_id, legacy).await
    }

    pub async fn create_invoice(&mut self, request: &InvoiceRequest) -> VaultResult<String> {
        self.require_contract(&request.contract_id)?;
        if let Some(asset_id) = &request.asset_id {
            if !self.assets.contains(asset_id) {
                return Err(VaultError::Validation(format!(
                    "Unknown asset {}",
                    asset_id
                )));
            }
        }
        if request.amount == Some(0) {
            return Err(VaultError::Validation(
                "Invoice amount must be positive".to_string(),
            ));
        }
        if let Some(merchant) = &request.merchant {
            self.validator.validate_free_text("Merchant", merchant)?;
        }
        if let Some(purpose) = &request.purpose {
            self.validator.validate_free_text("Purpose", purpose)?;
        }
        self.engine.invoice_create(request).await
    }

    pub async fn operations(&self, contract_id: &str) -> VaultResult<Vec<OperationRecord>> {
        self.require_contract(contract_id)?;
        self.engine.contract_operations(contract_id).await
    }

    /// Pay `invoice` from a contract: transfer, sign, publish.
    ///
    /// Stages run strictly in order and the first failure aborts the rest.
    /// Nothing reaches the chain unless the publish stage is attempted.
    pub async fn pay(
        &mut self,
        contract_id: &str,
        invoice: &str,
        fee: u64,
        giveaway: Option<u64>,
    ) -> VaultResult<PaymentResult> {
        let descriptor = self.require_contract(contract_id)?.policy().descriptor().to_string();
        self.validator.validate_fee(fee)?;
        self.validator.validate_encoded("Invoice", invoice)?;

        let request = PayRequest {
            contract_id: contract_id.to_string(),
            invoice: invoice.trim().to_string(),
            fee,
            giveaway,
        };

        log::info!("Payment from {}: requesting transfer", contract_id);
        let transfer = self.engine.invoice_pay(&request).await?;

        log::info!("Payment from {}: signing ({})", contract_id, self.signing);
        let signed = match self.signing {
            SigningMode::Remote => self.engine.transfer_sign(&transfer.psbt).await?,
            SigningMode::Local => self.signer.sign_transfer(&descriptor, &transfer.psbt)?,
        };

        log::info!("Payment from {}: publishing", contract_id);
        let txid = self.engine.transfer_publish(&signed).await?;
        log::info!("Payment from {} published as {}", contract_id, txid);

        self.events.publish(VaultEvent::PaymentPublished {
            contract_id: contract_id.to_string(),
            txid: txid.clone(),
        });
        Ok(PaymentResult {
            txid,
            psbt: signed,
            consignment: transfer.consignment,
        })
    }

    /// Accept an incoming token consignment.
    pub async fn accept(&mut self, consignment: &str) -> VaultResult<ConsignmentStatus> {
        self.validator.validate_encoded("Consignment", consignment)?;
        let status = self.engine.consignment_accept(consignment.trim()).await?;

        for failure in &status.failures {
            log::warn!("Consignment failure: {}", failure);
        }
        for warning in &status.warnings {
            log::warn!("Consignment warning: {}", warning);
        }
        self.events.publish(VaultEvent::ConsignmentAccepted {
            valid: status.valid,
        });
        Ok(status)
    }

    pub fn snapshot(&self) -> VaultResult<VaultSnapshot> {
        let contracts = self
            .contracts
            .iter()
            .map(|contract| {
                Ok(ContractSnapshot {
                    contract: contract.clone(),
                    balances: self.view(contract).balances()?,
                })
            })
            .collect::<VaultResult<Vec<_>>>()?;

        Ok(VaultSnapshot {
            network: self.network,
            contracts,
            assets: self.assets.iter().cloned().collect(),
            chain: self.chain.clone(),
            taken_at: Utc::now(),
        })
    }

    async fn refresh_ledger(&mut self, contract_id: &str) -> VaultResult<()> {
        let snapshot = self
            .engine
            .contract_balance(contract_id, self.sync.rescan, self.sync.lookup_depth)
            .await?;

        if let Some(missing) = snapshot.keys().find(|id| !self.assets.contains(id)) {
            log::error!(
                "Contract {} reports allocations of unknown asset {}",
                contract_id,
                missing
            );
            return Err(VaultError::InternalConsistency {
                asset_id: missing.clone(),
            });
        }

        let mut ledger = Ledger::new();
        for (asset_id, records) in snapshot {
            let allocations = records
                .into_iter()
                .map(|record| Allocation::from_record(&asset_id, record))
                .collect();
            ledger.replace(&asset_id, allocations);
        }
        self.ledgers.insert(contract_id.to_string(), ledger);
        Ok(())
    }

    fn view<'a>(&'a self, contract: &'a Contract) -> WalletContract<'a> {
        WalletContract::new(contract, self.ledgers.get(contract.id()), &self.assets)
    }

    fn require_contract(&self, contract_id: &str) -> VaultResult<&Contract> {
        self.contracts
            .iter()
            .find(|contract| contract.id() == contract_id)
            .ok_or_else(|| VaultError::ContractNotFound(contract_id.to_string()))
    }
}

fn acknowledged(method: &str, ack: Acknowledgement) -> VaultResult<()> {
    if ack.success {
        Ok(())
    } else {
        Err(VaultError::RemoteReported {
            code: 0,
            message: format!("{} was not acknowledged", method),
        })
    }
}

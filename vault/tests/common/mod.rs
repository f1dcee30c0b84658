#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::Network;
use parking_lot::Mutex;

use citadel_vault::{
    Acknowledgement, AddressRecord, AllocationRecord, AssetRecord, BalanceSnapshot, ChainState,
    ConsignmentStatus, ContractRecord, DescriptorCategory, InvoiceRequest, MempoolState,
    MemorySecretStore, OperationRecord, PayRequest, Policy, PreparedTransfer, RemoteEngine,
    TransferDirection, Vault, VaultConfig, VaultError, VaultResult,
};

pub const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
pub const UNSIGNED_PSBT: &str = "cHNidP8BAAoCAAAAAAAAAAAAAAA=";

#[derive(Default)]
struct EngineState {
    contracts: Vec<ContractRecord>,
    balances: HashMap<String, BalanceSnapshot>,
    assets: Vec<AssetRecord>,
    calls: Vec<String>,
    failures: HashMap<String, VaultError>,
    descriptors: Vec<(String, DescriptorCategory)>,
    transfer: Option<PreparedTransfer>,
    chain_height: u32,
}

/// Remote engine double driven by a script of snapshots and failures.
pub struct ScriptedEngine {
    network: Network,
    state: Mutex<EngineState>,
}

impl ScriptedEngine {
    pub fn new(network: Network) -> Arc<Self> {
        Arc::new(Self {
            network,
            state: Mutex::new(EngineState {
                chain_height: 420_000,
                ..EngineState::default()
            }),
        })
    }

    pub fn add_contract(&self, id: &str, name: &str) {
        self.state.lock().contracts.push(ContractRecord {
            id: id.to_string(),
            name: name.to_string(),
            chain: self.network,
            policy: Policy::Current(format!("wpkh({}-descriptor)", id)),
            created_at: None,
        });
    }

    pub fn set_balance(&self, contract_id: &str, snapshot: BalanceSnapshot) {
        self.state
            .lock()
            .balances
            .insert(contract_id.to_string(), snapshot);
    }

    pub fn set_assets(&self, assets: Vec<AssetRecord>) {
        self.state.lock().assets = assets;
    }

    pub fn set_transfer(&self, transfer: PreparedTransfer) {
        self.state.lock().transfer = Some(transfer);
    }

    pub fn fail(&self, method: &str, error: VaultError) {
        self.state
            .lock()
            .failures
            .insert(method.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn called(&self, method: &str) -> bool {
        self.state.lock().calls.iter().any(|call| call == method)
    }

    pub fn registered_descriptors(&self) -> Vec<(String, DescriptorCategory)> {
        self.state.lock().descriptors.clone()
    }

    fn record(&self, method: &str) -> VaultResult<()> {
        let mut state = self.state.lock();
        state.calls.push(method.to_string());
        match state.failures.get(method) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteEngine for ScriptedEngine {
    async fn contract_list(&self) -> VaultResult<Vec<ContractRecord>> {
        self.record("contract.list")?;
        Ok(self.state.lock().contracts.clone())
    }

    async fn single_sig_create(
        &self,
        name: &str,
        descriptor: &str,
        category: DescriptorCategory,
    ) -> VaultResult<ContractRecord> {
        self.record("contract.create_single_sig")?;
        let mut state = self.state.lock();
        state.descriptors.push((descriptor.to_string(), category));
        let record = ContractRecord {
            id: format!("contract{}", state.contracts.len() + 1),
            name: name.to_string(),
            chain: self.network,
            policy: Policy::Current(format!("wpkh({})", descriptor)),
            created_at: None,
        };
        state.contracts.push(record.clone());
        Ok(record)
    }

    async fn contract_rename(&self, contract_id: &str, name: &str) -> VaultResult<Acknowledgement> {
        self.record("contract.rename")?;
        let mut state = self.state.lock();
        let found = state.contracts.iter_mut().find(|c| c.id == contract_id);
        let success = match found {
            Some(contract) => {
                contract.name = name.to_string();
                true
            }
            None => false,
        };
        Ok(Acknowledgement { success })
    }

    async fn contract_delete(&self, contract_id: &str) -> VaultResult<Acknowledgement> {
        self.record("contract.delete")?;
        let mut state = self.state.lock();
        let before = state.contracts.len();
        state.contracts.retain(|c| c.id != contract_id);
        state.balances.remove(contract_id);
        Ok(Acknowledgement {
            success: state.contracts.len() < before,
        })
    }

    async fn contract_balance(
        &self,
        contract_id: &str,
        _rescan: bool,
        _lookup_depth: u8,
    ) -> VaultResult<BalanceSnapshot> {
        self.record("contract.balance")?;
        Ok(self
            .state
            .lock()
            .balances
            .get(contract_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn contract_operations(&self, contract_id: &str) -> VaultResult<Vec<OperationRecord>> {
        self.record("contract.operations")?;
        Ok(vec![OperationRecord {
            txid: TXID.to_string(),
            vout: 0,
            asset_id: "tbtc".to_string(),
            value: 10_000,
            direction: TransferDirection::Incoming {
                payer: Some(format!("payer-of-{}", contract_id)),
            },
            created_at: chrono::Utc::now(),
            height: Some(100),
            details: None,
        }])
    }

    async fn asset_list(&self) -> VaultResult<Vec<AssetRecord>> {
        self.record("asset.list")?;
        Ok(self.state.lock().assets.clone())
    }

    async fn asset_import(&self, genesis: &str) -> VaultResult<AssetRecord> {
        self.record("asset.import")?;
        let record = AssetRecord {
            id: "rgb1imported".to_string(),
            ticker: "IMP".to_string(),
            name: "Imported".to_string(),
            precision: 3,
            known_issued: Some(5_000),
            known_burned: None,
            max_issuable: Some(10_000),
            max_unknown: None,
            known_replaced: None,
            issuer: None,
            verified: false,
            ricardian_contract: None,
            genesis: genesis.to_string(),
        };
        self.state.lock().assets.push(record.clone());
        Ok(record)
    }

    async fn address_list(&self, contract_id: &str, legacy: bool) -> VaultResult<Vec<AddressRecord>> {
        self.record("address.list")?;
        Ok(vec![AddressRecord {
            address: format!("{}-address-0", contract_id),
            index: 0,
            legacy,
            created_at: None,
        }])
    }

    async fn address_create(&self, contract_id: &str, legacy: bool) -> VaultResult<AddressRecord> {
        self.record("address.create")?;
        Ok(AddressRecord {
            address: format!("{}-address-1", contract_id),
            index: 1,
            legacy,
            created_at: None,
        })
    }

    async fn invoice_create(&self, request: &InvoiceRequest) -> VaultResult<String> {
        self.record("invoice.create")?;
        Ok(format!("invoice-for-{}", request.contract_id))
    }

    async fn invoice_pay(&self, _request: &PayRequest) -> VaultResult<PreparedTransfer> {
        self.record("invoice.pay")?;
        Ok(self.state.lock().transfer.clone().unwrap_or(PreparedTransfer {
            psbt: UNSIGNED_PSBT.to_string(),
            consignment: None,
        }))
    }

    async fn transfer_sign(&self, psbt: &str) -> VaultResult<String> {
        self.record("transfer.sign")?;
        Ok(format!("{}signed", psbt))
    }

    async fn transfer_publish(&self, _psbt: &str) -> VaultResult<String> {
        self.record("transfer.publish")?;
        Ok(TXID.to_string())
    }

    async fn consignment_accept(&self, _consignment: &str) -> VaultResult<ConsignmentStatus> {
        self.record("consignment.accept")?;
        Ok(ConsignmentStatus {
            valid: true,
            failures: Vec::new(),
            warnings: vec!["unconfirmed anchor".to_string()],
        })
    }

    async fn blockchain_state(&self) -> VaultResult<ChainState> {
        self.record("chain.state")?;
        Ok(ChainState {
            height: self.state.lock().chain_height,
            tip: "00".repeat(32),
            median_time: None,
        })
    }

    async fn mempool_state(&self) -> VaultResult<MempoolState> {
        self.record("chain.mempool")?;
        Ok(MempoolState {
            tx_count: 12,
            vsize: 4_000,
            min_fee_rate: Some(1_000),
        })
    }
}

pub fn test_config() -> VaultConfig {
    VaultConfig::new("test")
}

pub fn allocation(txid_byte: u8, value: u64) -> AllocationRecord {
    AllocationRecord {
        txid: format!("{:02x}", txid_byte).repeat(32),
        vout: 0,
        value,
        address: None,
        height: Some(100),
    }
}

pub fn asset_record(id: &str, ticker: &str, known_issued: Option<u64>) -> AssetRecord {
    AssetRecord {
        id: id.to_string(),
        ticker: ticker.to_string(),
        name: format!("{} token", ticker),
        precision: 2,
        known_issued,
        known_burned: None,
        max_issuable: Some(1_000),
        max_unknown: None,
        known_replaced: None,
        issuer: Some("issuer".to_string()),
        verified: true,
        ricardian_contract: None,
        genesis: String::new(),
    }
}

/// Fresh vault over an in-memory store on testnet.
pub fn open_vault(namespace: &str) -> (MemorySecretStore, Arc<ScriptedEngine>, Vault) {
    let store = MemorySecretStore::new(namespace);
    let engine = ScriptedEngine::new(Network::Testnet);
    let vault = Vault::open(&test_config(), Arc::new(store.clone()), engine.clone())
        .unwrap_or_else(|err| panic!("vault should open: {}", err));
    (store, engine, vault)
}

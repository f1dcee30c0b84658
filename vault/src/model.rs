/// Vault data model: contracts, their unspent allocations, and the balances
/// derived from them.
///
/// Balances are never stored. They are recomputed from the allocation set on
/// every read, so they cannot drift from it.
use std::collections::BTreeMap;

use bitcoin::Network;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::types::{AllocationRecord, ChainState, ContractRecord, MempoolState, Policy};
use crate::asset::{AssetRegistry, DecimalAmount, Fungible};
use crate::errors::{VaultError, VaultResult};

/// A named wallet account governed by a spending policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contract {
    id: String,
    name: String,
    network: Network,
    policy: Policy,
    created_at: Option<DateTime<Utc>>,
}

impl Contract {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

impl From<ContractRecord> for Contract {
    fn from(record: ContractRecord) -> Self {
        Contract {
            id: record.id,
            name: record.name,
            network: record.chain,
            policy: record.policy,
            created_at: record.created_at,
        }
    }
}

/// Unspent value unit owned by one contract for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub asset_id: String,
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub address: Option<String>,
    pub height: Option<u32>,
}

impl Allocation {
    pub fn from_record(asset_id: &str, record: AllocationRecord) -> Self {
        Allocation {
            asset_id: asset_id.to_string(),
            txid: record.txid,
            vout: record.vout,
            value: record.value,
            address: record.address,
            height: record.height,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }
}

/// Sum of the allocations of one contract for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub contract_id: String,
    pub asset_id: String,
    pub atoms: u64,
    pub amount: DecimalAmount,
    pub allocations: usize,
}

/// Allocation set of a single contract, keyed by asset id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    allocations: BTreeMap<String, Vec<Allocation>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop whatever was held for `asset_id` and attach `allocations` instead.
    pub fn replace(&mut self, asset_id: &str, allocations: Vec<Allocation>) {
        self.allocations.remove(asset_id);
        self.allocations.insert(asset_id.to_string(), allocations);
    }

    pub fn allocations(&self, asset_id: &str) -> &[Allocation] {
        self.allocations
            .get(asset_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn asset_ids(&self) -> impl Iterator<Item = &str> {
        self.allocations.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.values().all(Vec::is_empty)
    }

    pub fn atoms(&self, asset_id: &str) -> VaultResult<u64> {
        self.allocations(asset_id)
            .iter()
            .try_fold(0u64, |total, allocation| total.checked_add(allocation.value))
            .ok_or_else(|| {
                VaultError::Validation(format!("Balance of asset {} overflows", asset_id))
            })
    }

    pub fn balance(
        &self,
        contract_id: &str,
        asset_id: &str,
        assets: &AssetRegistry,
    ) -> VaultResult<Balance> {
        let asset = assets
            .get(asset_id)
            .ok_or_else(|| VaultError::InternalConsistency {
                asset_id: asset_id.to_string(),
            })?;
        let atoms = self.atoms(asset_id)?;
        Ok(Balance {
            contract_id: contract_id.to_string(),
            asset_id: asset_id.to_string(),
            atoms,
            amount: asset.amount_from_atoms(atoms),
            allocations: self.allocations(asset_id).len(),
        })
    }

    pub fn balances(&self, contract_id: &str, assets: &AssetRegistry) -> VaultResult<Vec<Balance>> {
        self.asset_ids()
            .map(|asset_id| self.balance(contract_id, asset_id, assets))
            .collect()
    }
}

/// Latest blockchain and mempool figures reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainSnapshot {
    pub state: Option<ChainState>,
    pub mempool: Option<MempoolState>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChainSnapshot {
    pub fn height(&self) -> Option<u32> {
        self.state.as_ref().map(|state| state.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{Precision, TokenAsset};

    fn allocation(asset_id: &str, txid: &str, value: u64) -> Allocation {
        Allocation {
            asset_id: asset_id.to_string(),
            txid: txid.to_string(),
            vout: 0,
            value,
            address: None,
            height: Some(100),
        }
    }

    #[test]
    fn balances_follow_allocations() {
        let mut assets = AssetRegistry::new(Network::Testnet);
        assets
            .insert_token(TokenAsset::new("rgb1usd", "USDT", "Tether", Precision::new(2).unwrap()))
            .unwrap();

        let mut ledger = Ledger::new();
        ledger.replace(
            "tbtc",
            vec![allocation("tbtc", "aa", 150_000_000), allocation("tbtc", "bb", 50_000)],
        );
        ledger.replace("rgb1usd", vec![allocation("rgb1usd", "cc", 1234)]);

        let native = ledger.balance("c1", "tbtc", &assets).unwrap();
        assert_eq!(native.atoms, 150_050_000);
        assert_eq!(native.amount.to_string(), "1.5005");
        assert_eq!(native.allocations, 2);

        ledger.replace("tbtc", vec![allocation("tbtc", "dd", 1)]);
        assert_eq!(ledger.atoms("tbtc").unwrap(), 1);

        let token = ledger.balance("c1", "rgb1usd", &assets).unwrap();
        assert_eq!(token.amount.to_string(), "12.34");
    }

    #[test]
    fn unknown_asset_is_inconsistent() {
        let assets = AssetRegistry::new(Network::Testnet);
        let mut ledger = Ledger::new();
        ledger.replace("rgb1ghost", vec![allocation("rgb1ghost", "aa", 1)]);

        assert_eq!(
            ledger.balances("c1", &assets),
            Err(VaultError::InternalConsistency {
                asset_id: "rgb1ghost".into()
            })
        );
    }

    #[test]
    fn overflow_is_reported() {
        let mut ledger = Ledger::new();
        ledger.replace(
            "tbtc",
            vec![allocation("tbtc", "aa", u64::MAX), allocation("tbtc", "bb", 1)],
        );
        assert!(ledger.atoms("tbtc").is_err());
    }

    #[test]
    fn contract_from_record() {
        let record = ContractRecord {
            id: "contract1".into(),
            name: "main".into(),
            chain: Network::Testnet,
            policy: Policy::Current("wpkh(tpub/0/*)".into()),
            created_at: None,
        };
        let contract = Contract::from(record);
        assert_eq!(contract.policy().descriptor(), "wpkh(tpub/0/*)");
        assert_eq!(contract.network(), Network::Testnet);
    }
}

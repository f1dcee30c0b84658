/// Read-only view of one contract over the vault's ledger.
use bitcoin::Network;

use crate::api::types::Policy;
use crate::asset::{AssetRegistry, Fungible};
use crate::derivation::KeyOrigin;
use crate::errors::VaultResult;
use crate::model::{Allocation, Balance, Contract, Ledger};

pub struct WalletContract<'a> {
    contract: &'a Contract,
    ledger: Option<&'a Ledger>,
    assets: &'a AssetRegistry,
}

impl<'a> WalletContract<'a> {
    pub(crate) fn new(
        contract: &'a Contract,
        ledger: Option<&'a Ledger>,
        assets: &'a AssetRegistry,
    ) -> Self {
        Self {
            contract,
            ledger,
            assets,
        }
    }

    pub fn id(&self) -> &str {
        self.contract.id()
    }

    pub fn name(&self) -> &str {
        self.contract.name()
    }

    pub fn network(&self) -> Network {
        self.contract.network()
    }

    pub fn policy(&self) -> &Policy {
        self.contract.policy()
    }

    pub fn descriptor(&self) -> &str {
        self.contract.policy().descriptor()
    }

    /// Key origin of the descriptor, when it carries one.
    pub fn key_origin(&self) -> Option<KeyOrigin> {
        KeyOrigin::find(self.descriptor())
    }

    pub fn asset_ids(&self) -> Vec<&'a str> {
        self.ledger
            .map(|ledger| ledger.asset_ids().collect())
            .unwrap_or_default()
    }

    pub fn allocations(&self, asset_id: &str) -> &'a [Allocation] {
        match self.ledger {
            Some(ledger) => ledger.allocations(asset_id),
            None => &[],
        }
    }

    pub fn balances(&self) -> VaultResult<Vec<Balance>> {
        match self.ledger {
            Some(ledger) => ledger.balances(self.id(), self.assets),
            None => Ok(Vec::new()),
        }
    }

    /// Balance for `asset_id`; zero when the contract holds none of it.
    pub fn balance(&self, asset_id: &str) -> VaultResult<Balance> {
        match self.ledger {
            Some(ledger) => ledger.balance(self.id(), asset_id, self.assets),
            None => Ledger::new().balance(self.id(), asset_id, self.assets),
        }
    }

    pub fn native_balance(&self) -> VaultResult<Balance> {
        self.balance(self.assets.native_id())
    }

    pub fn has_tokens(&self) -> bool {
        self.asset_ids().into_iter().any(|asset_id| {
            !self.allocations(asset_id).is_empty()
                && self
                    .assets
                    .get(asset_id)
                    .map_or(true, |asset| !asset.is_native())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::ContractRecord;
    use crate::asset::{Precision, TokenAsset};

    fn contract() -> Contract {
        Contract::from(ContractRecord {
            id: "c1".into(),
            name: "main".into(),
            chain: Network::Testnet,
            policy: Policy::Current(
                "[73c5da0a/84'/1'/5']tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M/0/*".into(),
            ),
            created_at: None,
        })
    }

    fn allocation(asset_id: &str, value: u64) -> Allocation {
        Allocation {
            asset_id: asset_id.into(),
            txid: "ab".repeat(32),
            vout: 1,
            value,
            address: None,
            height: None,
        }
    }

    #[test]
    fn empty_contract_has_zero_balance() {
        let contract = contract();
        let assets = AssetRegistry::new(Network::Testnet);
        let view = WalletContract::new(&contract, None, &assets);

        assert_eq!(view.native_balance().unwrap().atoms, 0);
        assert!(view.balances().unwrap().is_empty());
        assert!(!view.has_tokens());
        assert_eq!(view.key_origin().unwrap().fingerprint.to_string(), "73c5da0a");
    }

    #[test]
    fn token_holdings() {
        let contract = contract();
        let mut assets = AssetRegistry::new(Network::Testnet);
        assets
            .insert_token(TokenAsset::new("rgb1tok", "TOK", "Token", Precision::new(0).unwrap()))
            .unwrap();
        let mut ledger = Ledger::new();
        ledger.replace("tbtc", vec![allocation("tbtc", 10_000)]);
        ledger.replace("rgb1tok", vec![allocation("rgb1tok", 7)]);

        let view = WalletContract::new(&contract, Some(&ledger), &assets);
        assert!(view.has_tokens());
        assert_eq!(view.balance("rgb1tok").unwrap().amount.to_string(), "7");
        assert_eq!(view.allocations("rgb1tok").len(), 1);
        assert_eq!(view.balances().unwrap().len(), 2);
    }
}

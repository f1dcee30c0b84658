//! Records exchanged with the remote wallet engine.
//!
//! Sum types use serde's externally tagged form, so the name of the single
//! field present selects the variant (`{"current": "..."}`).

use std::collections::BTreeMap;

use bitcoin::Network;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::SupplyMetrics;
use crate::derivation::DescriptorCategory;
use crate::errors::{VaultError, VaultResult};

/// Contract spending policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Single-key spending under an opaque descriptor.
    Current(String),
}

impl Policy {
    pub fn descriptor(&self) -> &str {
        match self {
            Policy::Current(descriptor) => descriptor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: String,
    pub name: String,
    pub chain: Network,
    pub policy: Policy,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default)]
    pub address: Option<String>,
    /// Block height; `None` while in the mempool.
    #[serde(default)]
    pub height: Option<u32>,
}

/// Unspent allocations of one contract, keyed by asset id.
pub type BalanceSnapshot = BTreeMap<String, Vec<AllocationRecord>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub ticker: String,
    pub name: String,
    pub precision: u8,
    #[serde(default)]
    pub known_issued: Option<u64>,
    #[serde(default)]
    pub known_burned: Option<u64>,
    #[serde(default)]
    pub max_issuable: Option<u64>,
    #[serde(default)]
    pub max_unknown: Option<u64>,
    #[serde(default)]
    pub known_replaced: Option<u64>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub ricardian_contract: Option<String>,
    #[serde(default)]
    pub genesis: String,
}

impl AssetRecord {
    pub fn supply(&self) -> SupplyMetrics {
        SupplyMetrics {
            known_issued: self.known_issued,
            known_burned: self.known_burned,
            max_issuable: self.max_issuable,
            max_unknown: self.max_unknown,
            known_replaced: self.known_replaced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub index: u32,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    AddressUtxo,
    Descriptor,
    Psbt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub kind: InvoiceType,
    pub contract_id: String,
    /// `None` requests the native asset.
    pub asset_id: Option<String>,
    pub amount: Option<u64>,
    pub merchant: Option<String>,
    pub purpose: Option<String>,
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRequest {
    pub contract_id: String,
    pub invoice: String,
    pub fee: u64,
    pub giveaway: Option<u64>,
}

/// Unsigned transfer produced by the engine for an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTransfer {
    /// Base64-encoded PSBT.
    pub psbt: String,
    /// Bech32 consignment for token transfers.
    #[serde(default)]
    pub consignment: Option<String>,
}

/// Direction of a historical transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Incoming {
        #[serde(default)]
        payer: Option<String>,
    },
    Outgoing {
        beneficiary: String,
        #[serde(default)]
        fee: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub txid: String,
    pub vout: u32,
    pub asset_id: String,
    pub value: u64,
    pub direction: TransferDirection,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentStatus {
    pub valid: bool,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub height: u32,
    pub tip: String,
    #[serde(default)]
    pub median_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolState {
    pub tx_count: u32,
    pub vsize: u64,
    /// Minimal fee rate accepted into the mempool, sat/kvB.
    #[serde(default)]
    pub min_fee_rate: Option<u64>,
}

/// Empty success payload for operations with no result data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContractParams {
    pub name: String,
    pub descriptor: String,
    pub category: DescriptorCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub code: i64,
    pub message: String,
}

/// Reply envelope: exactly one of `result` or `error` is expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteReply<T> {
    pub result: Option<T>,
    pub error: Option<RemoteFailure>,
}

impl<T> RemoteReply<T> {
    pub fn success(result: T) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(RemoteFailure {
                code,
                message: message.into(),
            }),
        }
    }

    /// Reported errors win over payloads; a reply with neither breaks the API contract.
    pub fn into_result(self, method: &str) -> VaultResult<T> {
        if let Some(error) = self.error {
            return Err(VaultError::RemoteReported {
                code: error.code,
                message: error.message,
            });
        }
        self.result.ok_or_else(|| VaultError::RemoteProtocol {
            method: method.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_uses_field_presence_tagging() {
        let policy = Policy::Current("wpkh([0badc0de/84'/1'/0']tpub/0/*)".into());
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json, serde_json::json!({ "current": "wpkh([0badc0de/84'/1'/0']tpub/0/*)" }));

        let unknown: Result<Policy, _> = serde_json::from_value(serde_json::json!({ "instant": "x" }));
        assert!(unknown.is_err());
    }

    #[test]
    fn transfer_direction_selected_by_field() {
        let incoming: TransferDirection =
            serde_json::from_value(serde_json::json!({ "incoming": {} })).unwrap();
        assert_eq!(incoming, TransferDirection::Incoming { payer: None });

        let outgoing: TransferDirection = serde_json::from_value(serde_json::json!({
            "outgoing": { "beneficiary": "tb1qexample", "fee": 250 }
        }))
        .unwrap();
        assert_eq!(
            outgoing,
            TransferDirection::Outgoing {
                beneficiary: "tb1qexample".into(),
                fee: Some(250)
            }
        );
    }

    #[test]
    fn reply_contract() {
        let ok: RemoteReply<u32> = serde_json::from_str(r#"{"result": 5}"#).unwrap();
        assert_eq!(ok.into_result("count"), Ok(5));

        let failed: RemoteReply<u32> =
            serde_json::from_str(r#"{"error": {"code": -3, "message": "no funds"}}"#).unwrap();
        assert_eq!(
            failed.into_result("count"),
            Err(VaultError::RemoteReported {
                code: -3,
                message: "no funds".into()
            })
        );

        let empty: RemoteReply<u32> = serde_json::from_str("{}").unwrap();
        assert_eq!(
            empty.into_result("count"),
            Err(VaultError::RemoteProtocol {
                method: "count".into()
            })
        );
    }

    #[test]
    fn asset_record_defaults_unknown_supply() {
        let record: AssetRecord = serde_json::from_value(serde_json::json!({
            "id": "rgb1abc",
            "ticker": "ABC",
            "name": "Alphabet",
            "precision": 8,
            "known_issued": 21
        }))
        .unwrap();
        let supply = record.supply();
        assert_eq!(supply.known_issued, Some(21));
        assert_eq!(supply.max_issuable, None);
        assert!(!record.verified);
    }
}

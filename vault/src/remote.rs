/// Remote wallet engine interface and its JSON-RPC transport.
///
/// The engine scans the chain, builds and broadcasts transfers, and validates
/// token consignments. The vault only consumes its snapshots.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::types::{
    Acknowledgement, AddressRecord, AssetRecord, BalanceSnapshot, ChainState, ConsignmentStatus,
    ContractRecord, CreateContractParams, InvoiceRequest, MempoolState, OperationRecord,
    PayRequest, PreparedTransfer, RemoteReply,
};
use crate::derivation::DescriptorCategory;
use crate::errors::{VaultError, VaultResult};

/// Capabilities the vault consumes from the remote engine.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    async fn contract_list(&self) -> VaultResult<Vec<ContractRecord>>;

    async fn single_sig_create(
        &self,
        name: &str,
        descriptor: &str,
        category: DescriptorCategory,
    ) -> VaultResult<ContractRecord>;

    async fn contract_rename(&self, contract_id: &str, name: &str) -> VaultResult<Acknowledgement>;

    async fn contract_delete(&self, contract_id: &str) -> VaultResult<Acknowledgement>;

    async fn contract_balance(
        &self,
        contract_id: &str,
        rescan: bool,
        lookup_depth: u8,
    ) -> VaultResult<BalanceSnapshot>;

    async fn contract_operations(&self, contract_id: &str) -> VaultResult<Vec<OperationRecord>>;

    async fn asset_list(&self) -> VaultResult<Vec<AssetRecord>>;

    async fn asset_import(&self, genesis: &str) -> VaultResult<AssetRecord>;

    async fn address_list(&self, contract_id: &str, legacy: bool) -> VaultResult<Vec<AddressRecord>>;

    async fn address_create(&self, contract_id: &str, legacy: bool) -> VaultResult<AddressRecord>;

    async fn invoice_create(&self, request: &InvoiceRequest) -> VaultResult<String>;

    async fn invoice_pay(&self, request: &PayRequest) -> VaultResult<PreparedTransfer>;

    /// Returns the signed PSBT in base64.
    async fn transfer_sign(&self, psbt: &str) -> VaultResult<String>;

    /// Broadcasts and returns the transaction id.
    async fn transfer_publish(&self, psbt: &str) -> VaultResult<String>;

    async fn consignment_accept(&self, consignment: &str) -> VaultResult<ConsignmentStatus>;

    async fn blockchain_state(&self) -> VaultResult<ChainState>;

    async fn mempool_state(&self) -> VaultResult<MempoolState>;
}

/// HTTP client speaking JSON-RPC 2.0 to the engine daemon.
pub struct JsonRpcEngine {
    client: Client,
    base_url: String,
}

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: String,
    method: String,
    params: T,
    id: u64,
}

impl JsonRpcEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> VaultResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(JsonRpcEngine {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make a JSON-RPC call to the engine
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> VaultResult<T> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: 1,
        };

        let url = format!("{}/jsonrpc", self.base_url);
        log::debug!("Calling remote method {}", method);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VaultError::Network(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VaultError::Network(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let reply: RemoteReply<T> = response
            .json()
            .await
            .map_err(|e| VaultError::Network(format!("Failed to parse response: {}", e)))?;

        reply.into_result(method)
    }
}

#[async_trait]
impl RemoteEngine for JsonRpcEngine {
    async fn contract_list(&self) -> VaultResult<Vec<ContractRecord>> {
        self.rpc_call("contract.list", serde_json::Value::Null).await
    }

    async fn single_sig_create(
        &self,
        name: &str,
        descriptor: &str,
        category: DescriptorCategory,
    ) -> VaultResult<ContractRecord> {
        let params = CreateContractParams {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            category,
        };
        self.rpc_call("contract.create_single_sig", serde_json::to_value(params)?)
            .await
    }

    async fn contract_rename(&self, contract_id: &str, name: &str) -> VaultResult<Acknowledgement> {
        let params = serde_json::json!({ "contract_id": contract_id, "name": name });
        self.rpc_call("contract.rename", params).await
    }

    async fn contract_delete(&self, contract_id: &str) -> VaultResult<Acknowledgement> {
        let params = serde_json::json!({ "contract_id": contract_id });
        self.rpc_call("contract.delete", params).await
    }

    async fn contract_balance(
        &self,
        contract_id: &str,
        rescan: bool,
        lookup_depth: u8,
    ) -> VaultResult<BalanceSnapshot> {
        let params = serde_json::json!({
            "contract_id": contract_id,
            "rescan": rescan,
            "lookup_depth": lookup_depth
        });
        self.rpc_call("contract.balance", params).await
    }

    async fn contract_operations(&self, contract_id: &str) -> VaultResult<Vec<OperationRecord>> {
        let params = serde_json::json!({ "contract_id": contract_id });
        self.rpc_call("contract.operations", params).await
    }

    async fn asset_list(&self) -> VaultResult<Vec<AssetRecord>> {
        self.rpc_call("asset.list", serde_json::Value::Null).await
    }

    async fn asset_import(&self, genesis: &str) -> VaultResult<AssetRecord> {
        let params = serde_json::json!({ "genesis": genesis });
        self.rpc_call("asset.import", params).await
    }

    async fn address_list(&self, contract_id: &str, legacy: bool) -> VaultResult<Vec<AddressRecord>> {
        let params = serde_json::json!({ "contract_id": contract_id, "legacy": legacy });
        self.rpc_call("address.list", params).await
    }

    async fn address_create(&self, contract_id: &str, legacy: bool) -> VaultResult<AddressRecord> {
        let params = serde_json::json!({ "contract_id": contract_id, "legacy": legacy });
        self.rpc_call("address.create", params).await
    }

    async fn invoice_create(&self, request: &InvoiceRequest) -> VaultResult<String> {
        self.rpc_call("invoice.create", serde_json::to_value(request)?)
            .await
    }

    async fn invoice_pay(&self, request: &PayRequest) -> VaultResult<PreparedTransfer> {
        self.rpc_call("invoice.pay", serde_json::to_value(request)?)
            .await
    }

    async fn transfer_sign(&self, psbt: &str) -> VaultResult<String> {
        let params = serde_json::json!({ "psbt": psbt });
        self.rpc_call("transfer.sign", params).await
    }

    async fn transfer_publish(&self, psbt: &str) -> VaultResult<String> {
        let params = serde_json::json!({ "psbt": psbt });
        self.rpc_call("transfer.publish", params).await
    }

    async fn consignment_accept(&self, consignment: &str) -> VaultResult<ConsignmentStatus> {
        let params = serde_json::json!({ "consignment": consignment });
        self.rpc_call("consignment.accept", params).await
    }

    async fn blockchain_state(&self) -> VaultResult<ChainState> {
        self.rpc_call("chain.state", serde_json::Value::Null).await
    }

    async fn mempool_state(&self) -> VaultResult<MempoolState> {
        self.rpc_call("chain.mempool", serde_json::Value::Null).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let engine = JsonRpcEngine::new("http://localhost:61399/", Duration::from_secs(5)).unwrap();
        assert_eq!(engine.base_url(), "http://localhost:61399");
    }

    #[test]
    fn request_envelope_is_jsonrpc_2() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "contract.list".to_string(),
            params: serde_json::Value::Null,
            id: 1,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "contract.list");
    }

    #[tokio::test]
    async fn unreachable_engine_reports_network_error() {
        let engine = JsonRpcEngine::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = engine.asset_list().await.unwrap_err();
        assert!(matches!(err, VaultError::Network(_)));
        assert!(err.is_remote());
    }

    #[tokio::test]
    #[ignore = "requires running engine at localhost:61399"]
    async fn test_real_contract_list() {
        let engine = JsonRpcEngine::new("http://localhost:61399", Duration::from_secs(30)).unwrap();
        let result = engine.contract_list().await;
        assert!(result.is_ok(), "Contract list should succeed");
    }

    #[tokio::test]
    #[ignore = "requires running engine at localhost:61399"]
    async fn test_real_chain_state() {
        let engine = JsonRpcEngine::new("http://localhost:61399", Duration::from_secs(30)).unwrap();
        let state = engine.blockchain_state().await;
        assert!(state.is_ok(), "Chain state call should succeed");
    }
}

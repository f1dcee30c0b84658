//! State-change notifications for UI layers.

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VaultEvent {
    AssetsSynced { updated: usize, inserted: usize },
    ContractsSynced { contracts: usize },
    ContractCreated { contract_id: String },
    ContractRenamed { contract_id: String, name: String },
    ContractRemoved { contract_id: String },
    AssetImported { asset_id: String },
    ChainUpdated { height: u32 },
    PaymentPublished { contract_id: String, txid: String },
    ConsignmentAccepted { valid: bool },
}

/// Fan-out of vault events. Publishing never blocks and never fails; slow
/// subscribers observe `Lagged` from the receiver instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: VaultEvent) {
        log::trace!("Vault event: {:?}", event);
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

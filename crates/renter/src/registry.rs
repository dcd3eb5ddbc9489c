use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::NegotiationError;

/// Outcome of a pushed contract as seen by the negotiator waiting on it.
pub type AckResult = Result<(), NegotiationError>;

/// Correlates contract ids with the negotiator waiting for that contract's acknowledgement.
///
/// Shared between negotiators (which register and remove entries) and the inbound
/// path (which delivers host acknowledgements). Entries are single use.
pub trait ContractRegistry: Send + Sync {
    /// Registers `tx` for `contract_id`, returning true if a stale entry was replaced.
    fn set(&self, contract_id: &str, tx: oneshot::Sender<AckResult>) -> bool;

    /// Drops the entry if present. Idempotent.
    fn remove(&self, contract_id: &str) -> bool;

    /// Hands `result` to the waiter for `contract_id`, consuming the entry.
    /// Unknown ids and waiters that already gave up are a no-op returning false.
    fn deliver(&self, contract_id: &str, result: AckResult) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self, contract_id: &str) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.set(contract_id, tx);
        rx
    }
}

#[derive(Default)]
pub struct InMemoryContractRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<AckResult>>>,
}

impl InMemoryContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContractRegistry for InMemoryContractRegistry {
    fn set(&self, contract_id: &str, tx: oneshot::Sender<AckResult>) -> bool {
        let Ok(mut map) = self.pending.lock() else {
            return false;
        };
        let replaced = map.insert(contract_id.to_string(), tx).is_some();
        if replaced {
            warn!(contract = %contract_id, "Replaced live contract registration");
        }
        replaced
    }

    fn remove(&self, contract_id: &str) -> bool {
        let Ok(mut map) = self.pending.lock() else {
            return false;
        };
        map.remove(contract_id).is_some()
    }

    fn deliver(&self, contract_id: &str, result: AckResult) -> bool {
        let tx = {
            let Ok(mut map) = self.pending.lock() else {
                return false;
            };
            map.remove(contract_id)
        };
        let Some(tx) = tx else {
            debug!(contract = %contract_id, "Dropping result for unregistered contract");
            return false;
        };
        tx.send(result).is_ok()
    }

    fn len(&self) -> usize {
        self.pending.lock().map(|map| map.len()).unwrap_or(0)
    }
}

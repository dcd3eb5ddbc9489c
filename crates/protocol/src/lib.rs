use libp2p_identity::{PeerId, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MARKET_PROTOCOL: &str = "/neurostore/market/1.0.0";

pub const SUPPORT_TOKENS_ROUTE: &str = "/storage/upload/supporttokens";
pub const INIT_CONTRACT_ROUTE: &str = "/storage/upload/init";
pub const RECV_CONTRACT_ROUTE: &str = "/storage/upload/recvcontract";

/// Address of a payment token as advertised by hosts and chosen by renters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenAddress(pub String);

impl TokenAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex addresses compare case-insensitively (checksummed vs lowercase).
    pub fn same_address(&self, other: &TokenAddress) -> bool {
        self.0.trim().eq_ignore_ascii_case(other.0.trim())
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardContract {
    pub contract_id: String,
    pub renter_id: String,
    pub host_id: String,
    pub shard_index: u32,
    pub shard_hash: String,
    pub shard_size: u64,
    pub file_hash: String,
    pub start_time_ms: u64,
    pub storage_length: u32,
    pub price: u64,
    pub total_pay: u64,
    pub token: TokenAddress,
}

impl GuardContract {
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "contract:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.contract_id,
            self.renter_id,
            self.host_id,
            self.shard_index,
            self.shard_hash,
            self.shard_size,
            self.file_hash,
            self.start_time_ms,
            self.storage_length,
            self.price,
            self.total_pay,
            self.token
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedGuardContract {
    pub contract: GuardContract,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl SignedGuardContract {
    /// Signature must be valid and the signing key must belong to the renter named in the contract.
    pub fn verify(&self) -> bool {
        let Ok(public_key) = PublicKey::try_decode_protobuf(&self.public_key) else {
            return false;
        };
        if public_key.to_peer_id().to_string() != self.contract.renter_id {
            return false;
        }
        public_key.verify(&self.contract.signing_payload(), &self.signature)
    }

    pub fn signer(&self) -> Option<PeerId> {
        PublicKey::try_decode_protobuf(&self.public_key)
            .ok()
            .map(|key| key.to_peer_id())
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitContractRequest {
    pub session_id: String,
    pub file_hash: String,
    pub shard_hash: String,
    pub price: u64,
    pub contract: Vec<u8>,
    pub storage_length: u32,
    pub shard_size: u64,
    pub shard_index: u32,
    pub renter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitContractResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Sent by a host back to the renter once it has accepted or refused a pushed contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractAck {
    pub session_id: String,
    pub contract_id: String,
    pub shard_hash: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

impl ContractAck {
    pub fn into_result(self) -> Result<(), String> {
        if self.accepted {
            Ok(())
        } else {
            Err(self
                .reason
                .unwrap_or_else(|| format!("host refused contract {}", self.contract_id)))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractAckResponse {
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketCommand {
    SupportTokens,
    InitContract(InitContractRequest),
    ContractAck(ContractAck),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketReply {
    /// Token label to token address.
    SupportTokens(BTreeMap<String, TokenAddress>),
    InitContract(InitContractResponse),
    ContractAck(ContractAckResponse),
}

impl MarketCommand {
    pub fn route(&self) -> &'static str {
        match self {
            MarketCommand::SupportTokens => SUPPORT_TOKENS_ROUTE,
            MarketCommand::InitContract(_) => INIT_CONTRACT_ROUTE,
            MarketCommand::ContractAck(_) => RECV_CONTRACT_ROUTE,
        }
    }
}

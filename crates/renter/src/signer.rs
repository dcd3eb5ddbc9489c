use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libp2p::{identity, PeerId};
use neuro_market_protocol::{GuardContract, SignedGuardContract, TokenAddress};

/// Everything the renter commits to for one shard on one host.
#[derive(Debug, Clone)]
pub struct ContractParams {
    pub contract_id: String,
    pub renter_id: String,
    pub host_id: String,
    pub shard_index: u32,
    pub shard_hash: String,
    pub shard_size: u64,
    pub file_hash: String,
    pub start_time: DateTime<Utc>,
    pub storage_length: u32,
    pub price: u64,
    pub total_pay: u64,
    pub token: TokenAddress,
}

impl ContractParams {
    pub fn to_guard_contract(&self) -> GuardContract {
        GuardContract {
            contract_id: self.contract_id.clone(),
            renter_id: self.renter_id.clone(),
            host_id: self.host_id.clone(),
            shard_index: self.shard_index,
            shard_hash: self.shard_hash.clone(),
            shard_size: self.shard_size,
            file_hash: self.file_hash.clone(),
            start_time_ms: self.start_time.timestamp_millis().max(0) as u64,
            storage_length: self.storage_length,
            price: self.price,
            total_pay: self.total_pay,
            token: self.token.clone(),
        }
    }
}

/// Produces the opaque serialized contract pushed to hosts.
#[async_trait]
pub trait ContractSigner: Send + Sync {
    async fn sign(&self, params: &ContractParams, offline_signing: bool) -> Result<Vec<u8>>;
}

/// Signs locally with the renter's node identity.
pub struct KeypairSigner {
    keypair: identity::Keypair,
    peer_id: PeerId,
}

impl KeypairSigner {
    pub fn new(keypair: identity::Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[async_trait]
impl ContractSigner for KeypairSigner {
    async fn sign(&self, params: &ContractParams, offline_signing: bool) -> Result<Vec<u8>> {
        if offline_signing {
            bail!("offline signing requested but no offline signer is configured");
        }
        if params.renter_id != self.peer_id.to_string() {
            bail!(
                "contract renter {} does not match signing identity {}",
                params.renter_id,
                self.peer_id
            );
        }

        let contract = params.to_guard_contract();
        let signature = self
            .keypair
            .sign(&contract.signing_payload())
            .map_err(|e| anyhow!("contract signature failed: {e}"))?;
        let signed = SignedGuardContract {
            contract,
            signature,
            public_key: self.keypair.public().encode_protobuf(),
        };
        Ok(signed.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(renter: &PeerId) -> ContractParams {
        ContractParams {
            contract_id: "ss,1,00ff".to_string(),
            renter_id: renter.to_string(),
            host_id: PeerId::random().to_string(),
            shard_index: 1,
            shard_hash: "c".repeat(64),
            shard_size: 4096,
            file_hash: "d".repeat(64),
            start_time: Utc::now(),
            storage_length: 30,
            price: 100,
            total_pay: 3,
            token: TokenAddress::new("0xWBTT"),
        }
    }

    #[tokio::test]
    async fn signed_bytes_verify_as_guard_contract() {
        let signer = KeypairSigner::new(identity::Keypair::generate_ed25519());
        let p = params(&signer.peer_id());
        let bytes = signer.sign(&p, false).await.expect("sign");
        let signed = SignedGuardContract::from_bytes(&bytes).expect("decode");
        assert!(signed.verify());
        assert_eq!(signed.contract.shard_index, 1);
        assert_eq!(signed.contract.total_pay, 3);
        assert_eq!(signed.contract.contract_id, p.contract_id);
    }

    #[tokio::test]
    async fn offline_signing_without_delegate_fails() {
        let signer = KeypairSigner::new(identity::Keypair::generate_ed25519());
        let p = params(&signer.peer_id());
        assert!(signer.sign(&p, true).await.is_err());
    }

    #[tokio::test]
    async fn refuses_to_sign_for_another_renter() {
        let signer = KeypairSigner::new(identity::Keypair::generate_ed25519());
        let p = params(&PeerId::random());
        assert!(signer.sign(&p, false).await.is_err());
    }
}

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use neuro_market_protocol::{
    InitContractRequest, MarketCommand, MarketReply, TokenAddress, INIT_CONTRACT_ROUTE,
    SUPPORT_TOKENS_ROUTE,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backoff::{self, BackoffPolicy};
use crate::config::{NegotiationConfig, TokenMismatchPolicy};
use crate::error::{NegotiationError, RetryError};
use crate::host::{parse_host_id, HostProvider};
use crate::preflight::PaymentQuote;
use crate::registry::ContractRegistry;
use crate::rpc::HostRpc;
use crate::session::{RenterSession, SessionEvent, ShardStatus};
use crate::signer::{ContractParams, ContractSigner};

/// Replaces "now + storage length" with an explicit window when re-placing shards of an existing file.
#[derive(Debug, Clone)]
pub struct RepairParams {
    pub renter_start: DateTime<Utc>,
    pub renter_end: DateTime<Utc>,
}

/// Terms shared by every shard of an upload.
#[derive(Debug, Clone)]
pub struct UploadTerms {
    pub token: TokenAddress,
    pub price: u64,
    pub shard_size: u64,
    pub storage_length: u32,
    pub offline_signing: bool,
    pub renter_id: PeerId,
    pub repair: Option<RepairParams>,
}

impl UploadTerms {
    /// Start time and length in days written into every contract of the upload.
    pub(crate) fn contract_window(&self) -> (DateTime<Utc>, u32) {
        match &self.repair {
            Some(repair) => {
                let days = (repair.renter_end - repair.renter_start).num_days().max(1);
                (repair.renter_start, u32::try_from(days).unwrap_or(u32::MAX))
            }
            None => (Utc::now(), self.storage_length),
        }
    }
}

/// Collaborators and settings shared by all negotiators of one session.
pub struct NegotiationContext {
    pub session: Arc<RenterSession>,
    pub hosts: Arc<dyn HostProvider>,
    pub rpc: Arc<dyn HostRpc>,
    pub signer: Arc<dyn ContractSigner>,
    pub registry: Arc<dyn ContractRegistry>,
    pub config: NegotiationConfig,
    pub backoff: BackoffPolicy,
    pub terms: UploadTerms,
    pub quote: PaymentQuote,
}

#[derive(Debug, Clone)]
pub struct ShardTask {
    /// Position in the session's shard list.
    pub position: usize,
    /// Index written into the contract.
    pub shard_index: u32,
    pub shard_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    Contracted { host: PeerId, contract_id: String },
    Cancelled,
    /// Stopped without exhausting the retry budget (no host, or token refused under `StopShard`).
    Abandoned(String),
    TimedOut(String),
}

enum AttemptOutcome {
    Contracted { host: PeerId, contract_id: String },
    Cancelled,
    SoftStop(String),
}

pub fn new_contract_id(session_id: &str, shard_index: u32) -> String {
    let mut nonce = [0u8; 8];
    OsRng.fill_bytes(&mut nonce);
    format!("{session_id},{shard_index},{}", hex::encode(nonce))
}

pub struct HostNegotiator {
    ctx: Arc<NegotiationContext>,
    shard: ShardTask,
}

impl HostNegotiator {
    pub fn new(ctx: Arc<NegotiationContext>, shard: ShardTask) -> Self {
        Self { ctx, shard }
    }

    pub async fn run(self) -> ShardOutcome {
        let session = self.ctx.session.clone();
        let result = backoff::retry(&self.ctx.backoff, session.cancel_token(), |attempt| {
            self.attempt(attempt)
        })
        .await;

        match result {
            Ok(AttemptOutcome::Contracted { host, contract_id }) => {
                if let Err(e) = session.mark_shard(self.shard.position, ShardStatus::Contracted) {
                    warn!(session = %session.id(), shard = self.shard.shard_index, error = %e, "Failed to record contracted shard");
                }
                info!(
                    session = %session.id(),
                    shard = self.shard.shard_index,
                    host = %host,
                    contract = %contract_id,
                    "Shard contract acknowledged"
                );
                ShardOutcome::Contracted { host, contract_id }
            }
            Ok(AttemptOutcome::Cancelled) | Err(RetryError::Cancelled) => {
                debug!(session = %session.id(), shard = self.shard.shard_index, "Shard negotiation cancelled");
                ShardOutcome::Cancelled
            }
            Ok(AttemptOutcome::SoftStop(reason)) => {
                self.fail_shard(&reason);
                ShardOutcome::Abandoned(reason)
            }
            Err(RetryError::Exhausted {
                max_elapsed,
                attempts,
                last,
            }) => {
                if session.is_cancelled() {
                    return ShardOutcome::Cancelled;
                }
                warn!(
                    session = %session.id(),
                    shard = self.shard.shard_index,
                    attempts,
                    last_error = %last,
                    "Shard retry budget exhausted"
                );
                let reason = format!("timeout: failed to setup contract in {max_elapsed:?}");
                self.fail_shard(&reason);
                ShardOutcome::TimedOut(reason)
            }
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<AttemptOutcome, NegotiationError> {
        let session = &self.ctx.session;
        if session.is_cancelled() {
            return Ok(AttemptOutcome::Cancelled);
        }

        let host = match self.ctx.hosts.next_valid_host().await {
            Ok(host) => host,
            Err(err) => {
                return Ok(AttemptOutcome::SoftStop(format!(
                    "no valid host for shard {}: {err}",
                    self.shard.shard_hash
                )))
            }
        };
        let host_pid = parse_host_id(&host).map_err(|e| {
            warn!(shard = %self.shard.shard_hash, host = %host, error = %e, "Host id decode failed");
            NegotiationError::InvalidHost {
                host: host.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(
            session = %session.id(),
            shard = self.shard.shard_index,
            attempt,
            host = %host_pid,
            "Negotiating shard contract"
        );

        if !self.host_supports_token(host_pid).await? {
            let token = self.ctx.terms.token.to_string();
            return match self.ctx.config.token_mismatch {
                TokenMismatchPolicy::Redraw => Err(NegotiationError::TokenUnsupported {
                    host: host_pid.to_string(),
                    token,
                }),
                TokenMismatchPolicy::StopShard => Ok(AttemptOutcome::SoftStop(format!(
                    "host {host_pid} does not support token {token}"
                ))),
            };
        }

        // Register before anything reaches the host so an early ack has somewhere to land.
        let contract_id = new_contract_id(session.id(), self.shard.shard_index);
        let ack_rx = self.ctx.registry.register(&contract_id);

        let contract = match self.sign_contract(&contract_id, host_pid).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(shard = %self.shard.shard_hash, error = %e, "Guard contract signing failed");
                self.ctx.registry.remove(&contract_id);
                return Err(e);
            }
        };
        self.push_contract(host_pid, contract_id.clone(), contract);

        let ack_timeout = self.ctx.config.ack_timeout;
        let received = tokio::select! {
            biased;
            _ = session.cancel_token().cancelled() => {
                self.ctx.registry.remove(&contract_id);
                return Ok(AttemptOutcome::Cancelled);
            }
            received = tokio::time::timeout(ack_timeout, ack_rx) => received,
        };
        self.ctx.registry.remove(&contract_id);
        match received {
            Ok(Ok(Ok(()))) => Ok(AttemptOutcome::Contracted {
                host: host_pid,
                contract_id,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(NegotiationError::Rejected {
                contract_id,
                reason: "acknowledgement channel closed".to_string(),
            }),
            Err(_) => Err(NegotiationError::AckTimeout {
                host: host_pid.to_string(),
                contract_id,
                timeout: ack_timeout,
            }),
        }
    }

    async fn host_supports_token(&self, host: PeerId) -> Result<bool, NegotiationError> {
        let reply = self
            .ctx
            .rpc
            .call(
                host,
                MarketCommand::SupportTokens,
                self.ctx.config.token_check_timeout,
            )
            .await
            .inspect_err(|e| {
                warn!(host = %host, error = %e, "Support-token query failed, will try again");
            })?;
        let MarketReply::SupportTokens(tokens) = reply else {
            return Err(NegotiationError::UnexpectedReply {
                route: SUPPORT_TOKENS_ROUTE,
            });
        };
        Ok(tokens
            .values()
            .any(|token| token.same_address(&self.ctx.terms.token)))
    }

    async fn sign_contract(
        &self,
        contract_id: &str,
        host: PeerId,
    ) -> Result<Vec<u8>, NegotiationError> {
        let terms = &self.ctx.terms;
        let (start_time, storage_length) = terms.contract_window();
        let params = ContractParams {
            contract_id: contract_id.to_string(),
            renter_id: terms.renter_id.to_string(),
            host_id: host.to_string(),
            shard_index: self.shard.shard_index,
            shard_hash: self.shard.shard_hash.clone(),
            shard_size: terms.shard_size,
            file_hash: self.ctx.session.file_hash().to_string(),
            start_time,
            storage_length,
            price: terms.price,
            total_pay: self.ctx.quote.expect_one_pay,
            token: terms.token.clone(),
        };
        self.ctx
            .signer
            .sign(&params, terms.offline_signing)
            .await
            .map_err(NegotiationError::Signing)
    }

    /// Fire-and-forget init push. Any failure lands on the contract's registry entry.
    fn push_contract(&self, host: PeerId, contract_id: String, contract: Vec<u8>) {
        let terms = &self.ctx.terms;
        let digest = hex::encode(Sha256::digest(&contract));
        let request = InitContractRequest {
            session_id: self.ctx.session.id().to_string(),
            file_hash: self.ctx.session.file_hash().to_string(),
            shard_hash: self.shard.shard_hash.clone(),
            price: terms.price,
            contract,
            storage_length: terms.contract_window().1,
            shard_size: terms.shard_size,
            shard_index: self.shard.shard_index,
            renter_id: terms.renter_id.to_string(),
        };
        let rpc = self.ctx.rpc.clone();
        let registry = self.ctx.registry.clone();
        let timeout = self.ctx.config.push_timeout;

        debug!(host = %host, contract = %contract_id, digest = %digest, "Pushing guard contract");
        tokio::spawn(async move {
            let failure = match rpc
                .call(host, MarketCommand::InitContract(request), timeout)
                .await
            {
                Ok(MarketReply::InitContract(resp)) if resp.accepted => None,
                Ok(MarketReply::InitContract(resp)) => Some(NegotiationError::Rejected {
                    contract_id: contract_id.clone(),
                    reason: resp
                        .reason
                        .unwrap_or_else(|| "host declined contract".to_string()),
                }),
                Ok(_) => Some(NegotiationError::UnexpectedReply {
                    route: INIT_CONTRACT_ROUTE,
                }),
                Err(e) => Some(NegotiationError::Transport(e)),
            };
            if let Some(err) = failure {
                debug!(host = %host, contract = %contract_id, error = %err, "Contract push failed");
                registry.deliver(&contract_id, Err(err));
            }
        });
    }

    fn fail_shard(&self, reason: &str) {
        let session = &self.ctx.session;
        if let Err(e) = session.mark_shard(self.shard.position, ShardStatus::Error) {
            warn!(session = %session.id(), shard = self.shard.shard_index, error = %e, "Failed to record shard error");
        }
        if let Err(terr) = session.to(SessionEvent::Error(reason.to_string())) {
            debug!(reason = %reason, error = %terr, "Session already left active state");
        }
    }
}

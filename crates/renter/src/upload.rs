use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::info;

use crate::config::RenterConfig;
use crate::error::UploadError;
use crate::host::HostProvider;
use crate::negotiator::{HostNegotiator, NegotiationContext, ShardOutcome, ShardTask, UploadTerms};
use crate::preflight::{run_preflight, BalanceSource, PaymentQuote, PricingRequest, RateOracle};
use crate::registry::ContractRegistry;
use crate::rpc::HostRpc;
use crate::session::RenterSession;
use crate::signer::ContractSigner;
use crate::watcher::{Finalizer, SessionCompletionWatcher, WatchOutcome};

/// External collaborators an upload talks to.
#[derive(Clone)]
pub struct RenterServices {
    pub rates: Arc<dyn RateOracle>,
    pub balances: Arc<dyn BalanceSource>,
    pub hosts: Arc<dyn HostProvider>,
    pub rpc: Arc<dyn HostRpc>,
    pub signer: Arc<dyn ContractSigner>,
    pub registry: Arc<dyn ContractRegistry>,
    pub finalizer: Arc<dyn Finalizer>,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub terms: UploadTerms,
    pub file_size: u64,
    /// Contract shard index per session shard. Defaults to the shard's position.
    pub shard_indexes: Option<Vec<u32>>,
}

#[derive(Debug)]
pub struct UploadReport {
    pub shards: Vec<ShardOutcome>,
    pub watch: WatchOutcome,
}

/// Tasks spawned for one upload.
pub struct UploadHandle {
    pub quote: PaymentQuote,
    negotiators: Vec<JoinHandle<ShardOutcome>>,
    watcher: JoinHandle<WatchOutcome>,
}

impl UploadHandle {
    /// Waits for every negotiator and the watcher. Shard outcomes are in session order.
    pub async fn join(self) -> Result<UploadReport, JoinError> {
        let mut shards = Vec::with_capacity(self.negotiators.len());
        for negotiator in self.negotiators {
            shards.push(negotiator.await?);
        }
        let watch = self.watcher.await?;
        Ok(UploadReport { shards, watch })
    }
}

/// Prices the session, then spawns one negotiator per shard and the session's completion
/// watcher. Returns as soon as everything is spawned.
pub async fn upload_shards(
    session: Arc<RenterSession>,
    services: &RenterServices,
    config: &RenterConfig,
    request: UploadRequest,
) -> Result<UploadHandle, UploadError> {
    config.validate()?;
    let shard_count = session.shard_count();
    let indexes = match request.shard_indexes {
        Some(indexes) if indexes.len() != shard_count => {
            return Err(UploadError::ShardIndexMismatch {
                expected: shard_count,
                actual: indexes.len(),
            })
        }
        Some(indexes) => indexes,
        None => (0..shard_count as u32).collect(),
    };

    let terms = request.terms;
    let (_, contract_days) = terms.contract_window();
    let quote = run_preflight(
        services.rates.as_ref(),
        services.balances.as_ref(),
        &PricingRequest {
            token: terms.token.clone(),
            price: terms.price,
            shard_size: terms.shard_size,
            storage_length: contract_days,
            shard_count,
        },
    )
    .await?;

    let offline_signing = terms.offline_signing;
    let ctx = Arc::new(NegotiationContext {
        session: session.clone(),
        hosts: services.hosts.clone(),
        rpc: services.rpc.clone(),
        signer: services.signer.clone(),
        registry: services.registry.clone(),
        config: config.negotiation.clone(),
        backoff: config.backoff.clone(),
        terms,
        quote,
    });

    let negotiators = session
        .shard_hashes()
        .iter()
        .zip(indexes)
        .enumerate()
        .map(|(position, (shard_hash, shard_index))| {
            let negotiator = HostNegotiator::new(
                ctx.clone(),
                ShardTask {
                    position,
                    shard_index,
                    shard_hash: shard_hash.clone(),
                },
            );
            tokio::spawn(negotiator.run())
        })
        .collect();

    let watcher = SessionCompletionWatcher::new(
        session.clone(),
        services.finalizer.clone(),
        request.file_size,
        offline_signing,
        config.negotiation.watch_interval,
    );
    let watcher = tokio::spawn(watcher.run());

    info!(
        session = %session.id(),
        shards = shard_count,
        expect_total_pay = quote.expect_total_pay,
        "Shard negotiation started"
    );
    Ok(UploadHandle {
        quote,
        negotiators,
        watcher,
    })
}

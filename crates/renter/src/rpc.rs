use async_trait::async_trait;
use libp2p::PeerId;
use neuro_market_protocol::{MarketCommand, MarketReply};
use std::time::Duration;

use crate::error::RpcError;

/// Request/response call to a remote host, bounded by `timeout`.
#[async_trait]
pub trait HostRpc: Send + Sync {
    async fn call(
        &self,
        host: PeerId,
        command: MarketCommand,
        timeout: Duration,
    ) -> Result<MarketReply, RpcError>;
}

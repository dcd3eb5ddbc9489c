//! Renter side of shard placement: prices an upload, negotiates one storage contract
//! per shard with remote hosts, and finalizes the session once every shard is placed.

pub mod backoff;
pub mod config;
pub mod error;
pub mod host;
pub mod negotiator;
pub mod p2p;
pub mod preflight;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod signer;
pub mod telemetry;
pub mod upload;
pub mod watcher;

pub use backoff::BackoffPolicy;
pub use config::{NegotiationConfig, RenterConfig, TokenMismatchPolicy};
pub use error::{ConfigError, NegotiationError, PreflightError, RpcError, SessionError, UploadError};
pub use host::{HostProvider, StaticHostProvider};
pub use negotiator::{HostNegotiator, RepairParams, ShardOutcome, UploadTerms};
pub use p2p::{spawn_transport, Libp2pHostRpc};
pub use preflight::{run_preflight, BalanceSource, PaymentQuote, PricingRequest, RateOracle};
pub use registry::{ContractRegistry, InMemoryContractRegistry};
pub use rpc::HostRpc;
pub use session::{RenterSession, SessionEvent, SessionStatus, ShardStatus};
pub use signer::{ContractParams, ContractSigner, KeypairSigner};
pub use upload::{upload_shards, RenterServices, UploadHandle, UploadReport, UploadRequest};
pub use watcher::{Finalizer, SessionCompletionWatcher, WatchOutcome};

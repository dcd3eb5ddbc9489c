use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::{RenterSession, SessionEvent, SessionStatus};

/// Submits a fully contracted session for settlement.
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn submit(&self, session: &RenterSession, file_size: u64, offline_signing: bool)
        -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Finalized,
    FinalizeFailed(String),
    /// At least one shard failed; the session was moved to `Error`.
    Aborted,
    Cancelled,
}

pub struct SessionCompletionWatcher {
    session: Arc<RenterSession>,
    finalizer: Arc<dyn Finalizer>,
    file_size: u64,
    offline_signing: bool,
    period: Duration,
}

impl SessionCompletionWatcher {
    pub fn new(
        session: Arc<RenterSession>,
        finalizer: Arc<dyn Finalizer>,
        file_size: u64,
        offline_signing: bool,
        period: Duration,
    ) -> Self {
        Self {
            session,
            finalizer,
            file_size,
            offline_signing,
            period,
        }
    }

    pub async fn run(self) -> WatchOutcome {
        let session = self.session.clone();
        let total = session.shard_count();
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = session.cancel_token().cancelled() => {
                    return self.cancelled_outcome();
                }
                _ = ticker.tick() => {}
            }

            let (complete, errored) = match session.complete_shards_num() {
                Ok(counts) => counts,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Shard counters unavailable, skipping tick");
                    continue;
                }
            };
            info!(
                session = %session.id(),
                contract_num = complete,
                error_num = errored,
                total,
                "Session progress"
            );

            if complete == total {
                return self.finalize().await;
            }
            if errored > 0 {
                if let Err(e) = session.to(SessionEvent::Error("there are some error shards".to_string())) {
                    debug!(session = %session.id(), error = %e, "Session already terminal");
                }
                return WatchOutcome::Aborted;
            }
        }
    }

    async fn finalize(&self) -> WatchOutcome {
        let session = &self.session;
        match self
            .finalizer
            .submit(session, self.file_size, self.offline_signing)
            .await
        {
            Ok(()) => match session.to(SessionEvent::Complete) {
                Ok(_) => WatchOutcome::Finalized,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Finalized session could not be completed");
                    WatchOutcome::FinalizeFailed(e.to_string())
                }
            },
            Err(e) => {
                let reason = format!("finalize failed: {e:#}");
                if let Err(terr) = session.to(SessionEvent::Error(reason.clone())) {
                    debug!(session = %session.id(), error = %terr, "Session already terminal");
                }
                WatchOutcome::FinalizeFailed(reason)
            }
        }
    }

    fn cancelled_outcome(&self) -> WatchOutcome {
        match self.session.status() {
            Ok(SessionStatus::Error) => WatchOutcome::Aborted,
            _ => {
                debug!(session = %self.session.id(), "Watcher stopped by cancellation");
                WatchOutcome::Cancelled
            }
        }
    }
}

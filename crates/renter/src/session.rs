use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Error,
    Complete,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Error(String),
    Complete,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Error(reason) => write!(f, "error event ({reason})"),
            SessionEvent::Complete => f.write_str("complete event"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Pending,
    Contracted,
    Error,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    shards: Vec<ShardStatus>,
    error_reason: Option<String>,
}

/// One upload: a fixed list of shards negotiated in parallel under a shared cancellation token.
pub struct RenterSession {
    id: String,
    file_hash: String,
    shard_hashes: Vec<String>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
}

impl RenterSession {
    pub fn new(id: impl Into<String>, file_hash: impl Into<String>, shard_hashes: Vec<String>) -> Self {
        Self::with_cancel(id, file_hash, shard_hashes, CancellationToken::new())
    }

    /// Session whose work also stops when `cancel` (typically a caller-owned parent token) fires.
    pub fn with_cancel(
        id: impl Into<String>,
        file_hash: impl Into<String>,
        shard_hashes: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Active);
        let shards = vec![ShardStatus::Pending; shard_hashes.len()];
        Self {
            id: id.into(),
            file_hash: file_hash.into(),
            shard_hashes,
            cancel,
            state: Mutex::new(SessionState {
                status: SessionStatus::Active,
                shards,
                error_reason: None,
            }),
            status_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn shard_hashes(&self) -> &[String] {
        &self.shard_hashes
    }

    pub fn shard_count(&self) -> usize {
        self.shard_hashes.len()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> Result<SessionStatus, SessionError> {
        Ok(self.lock()?.status)
    }

    pub fn error_reason(&self) -> Option<String> {
        self.lock().ok().and_then(|state| state.error_reason.clone())
    }

    /// Applies `event` to the session state machine. Terminal states accept no further events.
    pub fn to(&self, event: SessionEvent) -> Result<SessionStatus, SessionError> {
        let mut state = self.lock()?;
        let Some(next) = transition(state.status, &event) else {
            return Err(SessionError::InvalidTransition {
                from: state.status,
                event,
            });
        };
        state.status = next;
        match &event {
            SessionEvent::Error(reason) => {
                warn!(session = %self.id, reason = %reason, "Session aborted");
                state.error_reason = Some(reason.clone());
            }
            SessionEvent::Complete => {
                info!(session = %self.id, shards = self.shard_hashes.len(), "Session complete");
            }
        }
        drop(state);

        self.status_tx.send_replace(next);
        if next.is_terminal() {
            self.cancel.cancel();
        }
        Ok(next)
    }

    pub fn mark_shard(&self, index: usize, status: ShardStatus) -> Result<(), SessionError> {
        let mut state = self.lock()?;
        let total = state.shards.len();
        let slot = state
            .shards
            .get_mut(index)
            .ok_or(SessionError::UnknownShard { index, total })?;
        *slot = status;
        Ok(())
    }

    pub fn shard_status(&self, index: usize) -> Result<ShardStatus, SessionError> {
        let state = self.lock()?;
        state
            .shards
            .get(index)
            .copied()
            .ok_or(SessionError::UnknownShard {
                index,
                total: state.shards.len(),
            })
    }

    /// Returns `(contracted, errored)` shard counts.
    pub fn complete_shards_num(&self) -> Result<(usize, usize), SessionError> {
        let state = self.lock()?;
        let complete = state
            .shards
            .iter()
            .filter(|s| **s == ShardStatus::Contracted)
            .count();
        let errored = state
            .shards
            .iter()
            .filter(|s| **s == ShardStatus::Error)
            .count();
        Ok((complete, errored))
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, SessionError> {
        self.state.lock().map_err(|_| SessionError::Poisoned)
    }

    #[cfg(test)]
    pub(crate) fn poison_state(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.state.lock();
            panic!("session state poisoned on purpose");
        }));
    }

    #[cfg(test)]
    pub(crate) fn clear_poison(&self) {
        self.state.clear_poison();
    }
}

fn transition(from: SessionStatus, event: &SessionEvent) -> Option<SessionStatus> {
    match (from, event) {
        (SessionStatus::Active, SessionEvent::Error(_)) => Some(SessionStatus::Error),
        (SessionStatus::Active, SessionEvent::Complete) => Some(SessionStatus::Complete),
        _ => None,
    }
}

//! Per-thread admission control.
//!
//! At most one generation session may be active per thread. The registry is
//! a sharded map keyed by thread, so unrelated threads never contend on a
//! single lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_core::types::ThreadKey;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("a session is already active on this thread")]
    Busy,
    #[error("the relay is shutting down")]
    ShuttingDown,
}

struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
    started_at: Instant,
}

#[derive(Clone, Default)]
pub struct ThreadGuard {
    active: Arc<DashMap<ThreadKey, ActiveSession>>,
    closed: Arc<AtomicBool>,
}

impl ThreadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `thread` from idle to active, or report why it can't be.
    pub fn try_acquire(&self, thread: &ThreadKey) -> Result<SessionPermit, AcquireError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AcquireError::ShuttingDown);
        }
        match self.active.entry(thread.clone()) {
            Entry::Occupied(_) => Err(AcquireError::Busy),
            Entry::Vacant(slot) => {
                let id = Uuid::now_v7();
                let cancel = CancellationToken::new();
                slot.insert(ActiveSession {
                    id,
                    cancel: cancel.clone(),
                    started_at: Instant::now(),
                });
                debug!(thread = %thread, session = %id, "thread acquired");
                Ok(SessionPermit {
                    registry: Arc::clone(&self.active),
                    thread: thread.clone(),
                    id,
                    cancel,
                })
            }
        }
    }

    /// Signal the active session on `thread` to stop. Returns false when idle.
    pub fn cancel(&self, thread: &ThreadKey) -> bool {
        match self.active.get(thread) {
            Some(session) => {
                info!(
                    thread = %thread,
                    session = %session.id,
                    elapsed_ms = session.started_at.elapsed().as_millis() as u64,
                    "cancelling session"
                );
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Refuse new sessions and cancel every active one. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut n = 0;
        for entry in self.active.iter() {
            entry.cancel.cancel();
            n += 1;
        }
        if n > 0 {
            info!(sessions = n, "cancelled all active sessions");
        }
        n
    }

    pub fn state(&self, thread: &ThreadKey) -> ThreadState {
        if self.active.contains_key(thread) {
            ThreadState::Active
        } else {
            ThreadState::Idle
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Proof of ownership of a thread. Dropping it returns the thread to idle.
pub struct SessionPermit {
    registry: Arc<DashMap<ThreadKey, ActiveSession>>,
    thread: ThreadKey,
    id: Uuid,
    cancel: CancellationToken,
}

impl SessionPermit {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn thread(&self) -> &ThreadKey {
        &self.thread
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        // Only remove the entry this permit created.
        let id = self.id;
        self.registry.remove_if(&self.thread, |_, s| s.id == id);
        debug!(thread = %self.thread, session = %id, "thread released");
    }
}

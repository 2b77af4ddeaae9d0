//! Per-client state cell and identifier allocation

use shared::{ClientId, ClientState};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::Mutex;

/// Exclusive holder of one client's last-known state.
///
/// Only the owning actor's read loop writes to it. Anyone else gets a copy,
/// taken under a lock that is held for the length of the copy and nothing
/// more.
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<ClientState>,
}

impl StateCell {
    pub fn new(initial: ClientState) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    /// Copy of the current state. Leaves the accumulated delta alone.
    pub async fn current(&self) -> ClientState {
        *self.inner.lock().await
    }

    /// Copy of the current state, resetting the accumulated delta.
    ///
    /// Every broadcast reads through here, so each snapshot carries the
    /// movement reported since the previous one.
    pub async fn take_snapshot(&self) -> ClientState {
        let mut state = self.inner.lock().await;
        let copy = *state;
        state.delta = 0.0;
        copy
    }

    /// Merges a reported update and returns the resulting state.
    pub async fn merge(&self, update: &ClientState) -> ClientState {
        let mut state = self.inner.lock().await;
        state.merge_update(update);
        *state
    }
}

/// Hands out client identifiers: positive, increasing, never reused.
///
/// One generator is created at startup and shared by reference with every
/// actor constructor.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Generator whose first identifier is `first` (clamped to 1).
    pub fn starting_at(first: ClientId) -> Self {
        Self {
            next: AtomicI32::new(first.max(1)),
        }
    }

    /// Returns `None` once the positive range is used up.
    pub fn next_id(&self) -> Option<ClientId> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                (id > 0).then(|| id.wrapping_add(1))
            })
            .ok()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

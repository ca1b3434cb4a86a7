//! Per-conversation turn serialization.
//!
//! Sandbox acquisition alone would let two concurrent turns interleave
//! their writes and break the gap-free `step_order` invariant, so each
//! conversation has a `Semaphore(1)` held for the whole turn. A second
//! request on the same conversation waits its turn.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ConversationLockMap {
    locks: Mutex<HashMap<i64, Arc<Semaphore>>>,
}

impl Default for ConversationLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the turn lock for a conversation, waiting if a turn is
    /// already in flight. The permit releases on drop.
    pub async fn acquire(&self, conversation_id: i64) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquisition cannot fail.
        sem.acquire_owned().await.expect("conversation lock closed")
    }

    pub fn tracked_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop entries for conversations with no held or queued permit.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

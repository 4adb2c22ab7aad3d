//! Correlation id allocation and the table of operations awaiting a response.
//!
//! Each side of the bridge owns one allocator and one table for the ids it
//! issues. A pending entry is a oneshot sender; settling removes the entry
//! before the value is delivered, so an id can never be resolved twice.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::bridge::protocol::{ActionKind, CorrelationId};
use crate::error::ProtocolError;

/// Monotonic id source. Safe to share between concurrent submitters.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(initial: CorrelationId) -> Self {
        Self {
            next: AtomicU64::new(initial),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

struct Pending<T> {
    action: ActionKind,
    tx: oneshot::Sender<T>,
}

pub struct CallbackTable<T> {
    pending: DashMap<CorrelationId, Pending<T>>,
}

impl<T> Default for CallbackTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackTable<T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Record a pending operation. Must happen before the command is sent.
    pub fn register(
        &self,
        id: CorrelationId,
        action: ActionKind,
    ) -> Result<oneshot::Receiver<T>, ProtocolError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(ProtocolError::DuplicateCorrelationId { id }),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(Pending { action, tx });
                Ok(rx)
            }
        }
    }

    /// Remove the entry for `id` and hand it `value`.
    ///
    /// A caller that stopped waiting is not an error: the entry is still consumed.
    pub fn settle(
        &self,
        id: CorrelationId,
        action: ActionKind,
        value: T,
    ) -> Result<(), ProtocolError> {
        let Some((_, pending)) = self.pending.remove_if(&id, |_, p| p.action == action) else {
            return Err(match self.pending.get(&id) {
                Some(existing) => ProtocolError::ActionMismatch {
                    id,
                    expected: existing.action,
                    got: action,
                },
                None => ProtocolError::UnknownCorrelationId { id, action },
            });
        };

        if pending.tx.send(value).is_err() {
            tracing::debug!(id, %action, "Caller stopped waiting before the response arrived");
        }
        Ok(())
    }

    /// Drop a pending entry without resolving it. Its receiver observes a closed channel.
    pub fn discard(&self, id: CorrelationId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Settle every pending entry with a value built by `make`.
    pub fn fail_all(&self, mut make: impl FnMut() -> T) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(make());
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Whether `id` is pending as an `action` operation.
    pub fn expects(&self, id: CorrelationId, action: ActionKind) -> bool {
        self.pending.get(&id).is_some_and(|p| p.action == action)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

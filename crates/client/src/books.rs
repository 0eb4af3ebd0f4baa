use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pushfeed_book::{book_kind, Action, BookData, BookError, BookSnapshot, OrderBookStore};
use tracing::{debug, trace};

use crate::frame::{Arg, PushFrame};

/// A book state after one frame was applied and verified.
#[derive(Debug, Clone, PartialEq)]
pub struct BookEvent {
    pub arg: Arg,
    pub action: Action,
    pub snapshot: BookSnapshot,
}

/// One order-book store per book subscription key.
///
/// The read loop is the only writer. The mutex exists so other tasks can
/// take snapshots.
#[derive(Debug, Default)]
pub struct BookManager {
    stores: Mutex<HashMap<String, OrderBookStore>>,
    /// Keys with a resubscribe in flight, cleared by the next snapshot
    resyncing: Mutex<HashSet<String>>,
}

impl BookManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OrderBookStore>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_store(arg: &Arg) -> OrderBookStore {
        OrderBookStore::bound(arg.channel.clone(), arg.inst_id.clone().unwrap_or_default())
    }

    /// Start tracking a book topic. Non-book channels are ignored.
    pub fn track(&self, arg: &Arg) {
        if book_kind(&arg.channel).is_none() {
            return;
        }
        self.lock()
            .entry(arg.key())
            .or_insert_with(|| Self::new_store(arg));
    }

    pub fn untrack(&self, arg: &Arg) {
        self.lock().remove(&arg.key());
        self.resyncing().remove(&arg.key());
    }

    fn resyncing(&self) -> MutexGuard<'_, HashSet<String>> {
        self.resyncing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a book as awaiting a fresh snapshot. False if already marked.
    pub fn begin_resync(&self, arg: &Arg) -> bool {
        self.resyncing().insert(arg.key())
    }

    pub fn is_resyncing(&self, arg: &Arg) -> bool {
        self.resyncing().contains(&arg.key())
    }

    pub fn is_tracked(&self, arg: &Arg) -> bool {
        self.lock().contains_key(&arg.key())
    }

    /// Current verified state, if the book has received its snapshot.
    pub fn snapshot(&self, arg: &Arg) -> Option<BookSnapshot> {
        self.lock().get(&arg.key()).and_then(OrderBookStore::snapshot)
    }

    pub fn is_ready(&self, arg: &Arg) -> bool {
        self.lock()
            .get(&arg.key())
            .map(OrderBookStore::is_ready)
            .unwrap_or(false)
    }

    /// Drop every book's state, keeping the stores bound.
    pub fn reset_all(&self) {
        let mut stores = self.lock();
        for store in stores.values_mut() {
            store.reset();
        }
        self.resyncing().clear();
        debug!(books = stores.len(), "reset all order books");
    }

    /// Apply an order-book push. Stops at the first element that fails
    /// verification; that store is left reset. Pushes for books that are
    /// not tracked (late frames after an unsubscribe) are ignored.
    pub fn apply(&self, push: &PushFrame) -> Result<Vec<BookEvent>, BookError> {
        let mut stores = self.lock();
        let Some(store) = stores.get_mut(&push.arg.key()) else {
            trace!(channel = %push.arg.channel, inst_id = ?push.arg.inst_id, "push for untracked book");
            return Ok(Vec::new());
        };

        let elements: Vec<BookData> = push
            .decode()
            .map_err(|e| BookError::InvalidPayload(e.to_string()))?;
        let action = push.action.as_deref().and_then(Action::parse);
        let inst_id = push.arg.inst_id.clone().unwrap_or_default();

        let mut events = Vec::with_capacity(elements.len());
        for data in &elements {
            let applied = store.apply(&push.arg.channel, &inst_id, action, data)?;
            trace!(
                channel = %push.arg.channel,
                inst_id = %inst_id,
                action = ?applied,
                seq_id = data.seq_id,
                "book frame applied"
            );
            if applied == Action::Snapshot {
                self.resyncing().remove(&push.arg.key());
            }
            if let Some(snapshot) = store.snapshot() {
                events.push(BookEvent {
                    arg: push.arg.clone(),
                    action: applied,
                    snapshot,
                });
            }
        }
        Ok(events)
    }
}

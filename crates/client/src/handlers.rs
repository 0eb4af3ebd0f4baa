//! Callback slots
//!
//! Handlers can be installed before `run` or swapped while streaming. Each
//! slot is read under a short read lock that clones the `Arc` out, so a
//! callback never runs while the lock is held.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::books::BookEvent;
use crate::error::ClientError;
use crate::frame::{EventFrame, PushFrame};
use crate::topics::TopicKind;

pub type RawHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type PushHandler = Arc<dyn Fn(&PushFrame) + Send + Sync>;
pub type BookHandler = Arc<dyn Fn(&BookEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&EventFrame) + Send + Sync>;

#[derive(Default)]
struct Slots {
    raw: Option<RawHandler>,
    book: Option<BookHandler>,
    push: HashMap<TopicKind, PushHandler>,
    error: Option<ErrorHandler>,
    event: Option<EventHandler>,
}

#[derive(Default)]
pub struct Handlers {
    slots: RwLock<Slots>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.read();
        f.debug_struct("Handlers")
            .field("raw", &slots.raw.is_some())
            .field("book", &slots.book.is_some())
            .field("push", &slots.push.keys().collect::<Vec<_>>())
            .field("error", &slots.error.is_some())
            .field("event", &slots.event.is_some())
            .finish()
    }
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every inbound text frame, before classification.
    pub fn on_raw<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.write().raw = Some(Arc::new(f));
    }

    /// Verified order-book states, after each applied frame.
    pub fn on_book<F>(&self, f: F)
    where
        F: Fn(&BookEvent) + Send + Sync + 'static,
    {
        self.write().book = Some(Arc::new(f));
    }

    /// Data pushes for one topic kind.
    pub fn on_push<F>(&self, kind: TopicKind, f: F)
    where
        F: Fn(&PushFrame) + Send + Sync + 'static,
    {
        self.write().push.insert(kind, Arc::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.write().error = Some(Arc::new(f));
    }

    /// Events that are not acks, login results or errors.
    pub fn on_event<F>(&self, f: F)
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.write().event = Some(Arc::new(f));
    }

    pub fn clear_push(&self, kind: TopicKind) {
        self.write().push.remove(&kind);
    }

    pub fn raw(&self) -> Option<RawHandler> {
        self.read().raw.clone()
    }

    pub fn book(&self) -> Option<BookHandler> {
        self.read().book.clone()
    }

    pub fn push(&self, kind: TopicKind) -> Option<PushHandler> {
        self.read().push.get(&kind).cloned()
    }

    pub fn error(&self) -> Option<ErrorHandler> {
        self.read().error.clone()
    }

    pub fn event(&self) -> Option<EventHandler> {
        self.read().event.clone()
    }

    pub fn has_raw(&self) -> bool {
        self.read().raw.is_some()
    }
}

//! Local order book reconstruction
//!
//! A store is bound to one (channel, instrument) pair. It is replaced
//! wholesale by snapshots, mutated in place by sequenced deltas, and verified
//! against the exchange checksum after every frame.
//!
//! The store is not synchronized. Exactly one call path may mutate it at a
//! time; callers sharing a store across tasks must serialize access.

use std::cmp::Ordering;
use tracing::debug;

use crate::checksum::checksum;
use crate::decimal;
use crate::error::BookError;
use crate::types::{book_kind, Action, BookData, BookKind, BookSnapshot, Level, Side, SEQ_UNSET};

#[derive(Debug, Default)]
pub struct OrderBookStore {
    channel: Option<String>,
    inst_id: Option<String>,
    bids: Vec<Level>,
    asks: Vec<Level>,
    ts: String,
    seq_id: i64,
    checksum: i32,
    ready: bool,
}

impl OrderBookStore {
    /// Create an unbound store; identity is taken from the first frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store bound to a channel and instrument.
    pub fn bound(channel: impl Into<String>, inst_id: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            inst_id: Some(inst_id.into()),
            ..Self::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn inst_id(&self) -> Option<&str> {
        self.inst_id.as_deref()
    }

    pub fn bids(&self) -> &[Level] {
        &self.bids
    }

    pub fn asks(&self) -> &[Level] {
        &self.asks
    }

    pub fn seq_id(&self) -> i64 {
        self.seq_id
    }

    pub fn last_checksum(&self) -> i32 {
        self.checksum
    }

    pub fn ts(&self) -> &str {
        &self.ts
    }

    /// Copy of the current book, or `None` until a snapshot has been applied.
    pub fn snapshot(&self) -> Option<BookSnapshot> {
        if !self.ready {
            return None;
        }
        Some(BookSnapshot {
            channel: self.channel.clone().unwrap_or_default(),
            inst_id: self.inst_id.clone().unwrap_or_default(),
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            ts: self.ts.clone(),
            seq_id: self.seq_id,
            checksum: self.checksum,
        })
    }

    /// Discard all levels and mark the store unready. Identity is kept.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.ts.clear();
        self.seq_id = SEQ_UNSET;
        self.checksum = 0;
        self.ready = false;
    }

    /// Apply one element of an order-book push.
    ///
    /// `inst_id` is the instrument from the push's `arg`; a payload-level
    /// `instId` takes precedence when present. `action` is the frame's
    /// explicit tag, if any. Returns the action that was actually applied.
    pub fn apply(
        &mut self,
        channel: &str,
        inst_id: &str,
        action: Option<Action>,
        data: &BookData,
    ) -> Result<Action, BookError> {
        let inst_id = data.inst_id.as_deref().unwrap_or(inst_id);
        self.bind(channel, inst_id)?;

        let kind = book_kind(channel).ok_or_else(|| {
            BookError::InvalidPayload(format!("{} is not an order-book channel", channel))
        })?;

        let action = match kind {
            BookKind::FullRefresh => Action::Snapshot,
            BookKind::Sequenced => action.unwrap_or(if self.ready {
                Action::Update
            } else {
                Action::Snapshot
            }),
        };

        match action {
            Action::Snapshot => self.apply_snapshot(data)?,
            Action::Update => self.apply_update(data)?,
        }
        Ok(action)
    }

    fn bind(&mut self, channel: &str, inst_id: &str) -> Result<(), BookError> {
        if channel.is_empty() || inst_id.is_empty() {
            return Err(BookError::InvalidPayload(
                "book frame without channel or instrument".to_string(),
            ));
        }

        match (&self.channel, &self.inst_id) {
            (Some(bound_channel), Some(bound_inst)) => {
                if bound_channel != channel || bound_inst != inst_id {
                    return Err(BookError::IdentityMismatch {
                        expected: format!("{}/{}", bound_channel, bound_inst),
                        got: format!("{}/{}", channel, inst_id),
                    });
                }
            }
            _ => {
                self.channel = Some(channel.to_string());
                self.inst_id = Some(inst_id.to_string());
            }
        }
        Ok(())
    }

    fn apply_snapshot(&mut self, data: &BookData) -> Result<(), BookError> {
        self.reset();

        let bids = normalize(&data.bids, Side::Bid);
        let asks = normalize(&data.asks, Side::Ask);
        let computed = checksum(&bids, &asks);

        if let Some(declared) = data.checksum {
            if declared != computed {
                return Err(self.checksum_error(declared, computed));
            }
        }

        self.bids = bids;
        self.asks = asks;
        self.ts = data.ts.clone();
        self.seq_id = data.seq_id;
        self.checksum = computed;
        self.ready = true;
        Ok(())
    }

    fn apply_update(&mut self, data: &BookData) -> Result<(), BookError> {
        if !self.ready {
            return Err(BookError::NotReady {
                channel: self.channel.clone().unwrap_or_default(),
                inst_id: self.inst_id.clone().unwrap_or_default(),
            });
        }

        let unsequenced = self.seq_id == SEQ_UNSET && data.prev_seq_id == SEQ_UNSET;
        if !unsequenced && data.prev_seq_id != self.seq_id {
            let err = BookError::SequenceGap {
                channel: self.channel.clone().unwrap_or_default(),
                inst_id: self.inst_id.clone().unwrap_or_default(),
                expected_prev: self.seq_id,
                got_prev: data.prev_seq_id,
                seq_id: data.seq_id,
            };
            debug!(error = %err, "resetting order book");
            self.reset();
            return Err(err);
        }

        merge(&mut self.bids, &data.bids, Side::Bid);
        merge(&mut self.asks, &data.asks, Side::Ask);
        let computed = checksum(&self.bids, &self.asks);

        if let Some(declared) = data.checksum {
            if declared != computed {
                let err = self.checksum_error(declared, computed);
                debug!(error = %err, "resetting order book");
                self.reset();
                return Err(err);
            }
        }

        self.ts = data.ts.clone();
        self.seq_id = data.seq_id;
        self.checksum = computed;
        Ok(())
    }

    fn checksum_error(&self, declared: i32, computed: i32) -> BookError {
        BookError::ChecksumMismatch {
            channel: self.channel.clone().unwrap_or_default(),
            inst_id: self.inst_id.clone().unwrap_or_default(),
            declared,
            computed,
        }
    }
}

/// Sort a snapshot side, dropping zero sizes and collapsing repeated prices.
fn normalize(levels: &[Level], side: Side) -> Vec<Level> {
    let mut out: Vec<Level> = levels
        .iter()
        .filter(|level| !decimal::is_zero(&level.size))
        .cloned()
        .collect();
    out.sort_by(|a, b| side.order(&a.price, &b.price));
    // Later occurrences of a price win
    out.dedup_by(|later, kept| {
        if decimal::compare(&later.price, &kept.price) == Ordering::Equal {
            std::mem::swap(later, kept);
            true
        } else {
            false
        }
    });
    out
}

/// Merge delta levels into a sorted side.
///
/// Size zero deletes the level (no-op when absent); any other size
/// overwrites an existing level or inserts at the sorted position.
fn merge(levels: &mut Vec<Level>, updates: &[Level], side: Side) {
    for update in updates {
        let position = levels.binary_search_by(|probe| side.order(&probe.price, &update.price));
        match (position, decimal::is_zero(&update.size)) {
            (Ok(i), true) => {
                levels.remove(i);
            }
            (Ok(i), false) => levels[i] = update.clone(),
            (Err(_), true) => {}
            (Err(i), false) => levels.insert(i, update.clone()),
        }
    }
}

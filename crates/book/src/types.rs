//! Order book payload types
//!
//! Levels travel as JSON string arrays `[price, size, ...]`. Only price and
//! size take part in merging; any further positional fields are carried
//! through untouched.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::decimal;

/// Sequence value meaning "not populated by this topic".
pub const SEQ_UNSET: i64 = 0;

/// One price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Level {
    pub price: String,
    pub size: String,
    /// Positional fields after size (deprecated field, order count, ...)
    pub extra: Vec<String>,
}

impl Level {
    pub fn new(price: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            size: size.into(),
            extra: Vec::new(),
        }
    }

    pub fn with_extra(price: impl Into<String>, size: impl Into<String>, extra: Vec<String>) -> Self {
        Self {
            price: price.into(),
            size: size.into(),
            extra,
        }
    }
}

impl TryFrom<Vec<String>> for Level {
    type Error = String;

    fn try_from(mut fields: Vec<String>) -> Result<Self, Self::Error> {
        if fields.len() < 2 {
            return Err(format!(
                "price level needs at least price and size, got {} field(s)",
                fields.len()
            ));
        }
        let extra = fields.split_off(2);
        let size = fields.pop().unwrap_or_default();
        let price = fields.pop().unwrap_or_default();
        Ok(Self { price, size, extra })
    }
}

impl From<Level> for Vec<String> {
    fn from(level: Level) -> Self {
        let mut fields = Vec::with_capacity(2 + level.extra.len());
        fields.push(level.price);
        fields.push(level.size);
        fields.extend(level.extra);
        fields
    }
}

/// Book side, which fixes the sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Descending by price
    Bid,
    /// Ascending by price
    Ask,
}

impl Side {
    /// Position of price `a` relative to price `b` in this side's book order.
    pub fn order(self, a: &str, b: &str) -> Ordering {
        match self {
            Side::Bid => decimal::compare(b, a),
            Side::Ask => decimal::compare(a, b),
        }
    }
}

/// One element of an order-book push's `data` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookData {
    #[serde(default)]
    pub asks: Vec<Level>,
    #[serde(default)]
    pub bids: Vec<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst_id: Option<String>,
    #[serde(default)]
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<i32>,
    #[serde(default)]
    pub prev_seq_id: i64,
    #[serde(default)]
    pub seq_id: i64,
}

/// How a frame is merged into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Snapshot,
    Update,
}

impl Action {
    /// Parse the wire `action` tag. Unknown tags yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "snapshot" => Some(Action::Snapshot),
            "update" => Some(Action::Update),
            _ => None,
        }
    }
}

/// Delivery model of an order-book channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookKind {
    /// Fixed depth; every frame replaces the whole book.
    FullRefresh,
    /// Snapshot followed by sequenced deltas.
    Sequenced,
}

/// Classify a channel name. `None` means it is not an order-book channel.
pub fn book_kind(channel: &str) -> Option<BookKind> {
    match channel {
        "books5" | "bbo-tbt" => Some(BookKind::FullRefresh),
        c if c.starts_with("books") => Some(BookKind::Sequenced),
        _ => None,
    }
}

/// Immutable copy of a ready book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookSnapshot {
    pub channel: String,
    pub inst_id: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub ts: String,
    pub seq_id: i64,
    pub checksum: i32,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }
}

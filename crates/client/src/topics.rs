//! Topic kinds and typed payloads for common public channels

use serde::{Deserialize, Serialize};

/// Coarse classification of a push channel, used to pick a callback slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    OrderBook,
    Ticker,
    Trade,
    Candle,
    Account,
    Position,
    Order,
    Other,
}

impl TopicKind {
    pub fn from_channel(channel: &str) -> Self {
        if pushfeed_book::book_kind(channel).is_some() {
            return TopicKind::OrderBook;
        }
        match channel {
            "tickers" => TopicKind::Ticker,
            "trades" | "trades-all" => TopicKind::Trade,
            "account" => TopicKind::Account,
            "positions" | "balance_and_position" => TopicKind::Position,
            "orders" | "orders-algo" | "algo-advance" => TopicKind::Order,
            c if c.starts_with("candle") || c.starts_with("mark-price-candle") => {
                TopicKind::Candle
            }
            _ => TopicKind::Other,
        }
    }

    /// Metric and log label.
    pub fn label(self) -> &'static str {
        match self {
            TopicKind::OrderBook => "orderbook",
            TopicKind::Ticker => "ticker",
            TopicKind::Trade => "trade",
            TopicKind::Candle => "candle",
            TopicKind::Account => "account",
            TopicKind::Position => "position",
            TopicKind::Order => "order",
            TopicKind::Other => "other",
        }
    }
}

/// `tickers` channel payload. Numeric fields stay as strings to keep precision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    #[serde(default)]
    pub inst_type: String,
    pub inst_id: String,
    #[serde(default)]
    pub last: String,
    #[serde(default)]
    pub last_sz: String,
    #[serde(default)]
    pub ask_px: String,
    #[serde(default)]
    pub ask_sz: String,
    #[serde(default)]
    pub bid_px: String,
    #[serde(default)]
    pub bid_sz: String,
    #[serde(default)]
    pub open24h: String,
    #[serde(default)]
    pub high24h: String,
    #[serde(default)]
    pub low24h: String,
    #[serde(default)]
    pub vol24h: String,
    #[serde(default)]
    pub ts: String,
}

/// `trades` channel payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub inst_id: String,
    pub trade_id: String,
    pub px: String,
    pub sz: String,
    pub side: String,
    #[serde(default)]
    pub count: String,
    #[serde(default)]
    pub ts: String,
}

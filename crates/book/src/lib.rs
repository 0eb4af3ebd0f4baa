//! pushfeed-book: local order book reconstruction
//!
//! Applies snapshot and delta frames to sorted price levels, checks sequence
//! continuity, and verifies the exchange's CRC32 over the top of the book.
//! Prices are compared as exact decimal strings.

pub mod checksum;
pub mod decimal;
pub mod error;
pub mod store;
pub mod types;

pub use checksum::{canonical_string, checksum, CHECKSUM_DEPTH};
pub use error::BookError;
pub use store::OrderBookStore;
pub use types::{book_kind, Action, BookData, BookKind, BookSnapshot, Level, Side, SEQ_UNSET};

//! Order book integrity checksum
//!
//! The exchange publishes a CRC32 over the top levels of each side,
//! interleaved bid/ask, rendered as `price:size` pairs joined with `:`.

use crate::types::Level;

/// Number of levels per side covered by the checksum.
pub const CHECKSUM_DEPTH: usize = 25;

/// Build the canonical string the checksum is computed over.
///
/// Order is `bid[0], ask[0], bid[1], ask[1], ...`; once one side runs out
/// the other continues alone. At most [`CHECKSUM_DEPTH`] levels per side.
pub fn canonical_string(bids: &[Level], asks: &[Level]) -> String {
    let mut out = String::with_capacity(CHECKSUM_DEPTH * 2 * 16);
    let mut push = |level: &Level| {
        if !out.is_empty() {
            out.push(':');
        }
        out.push_str(&level.price);
        out.push(':');
        out.push_str(&level.size);
    };

    for i in 0..CHECKSUM_DEPTH {
        if let Some(bid) = bids.get(i) {
            push(bid);
        }
        if let Some(ask) = asks.get(i) {
            push(ask);
        }
    }
    out
}

/// CRC32 (IEEE) of `input`, reinterpreted as a signed 32-bit integer.
pub fn crc32(input: &str) -> i32 {
    crc32fast::hash(input.as_bytes()) as i32
}

/// Checksum of the given sorted sides.
pub fn checksum(bids: &[Level], asks: &[Level]) -> i32 {
    crc32(&canonical_string(bids, asks))
}

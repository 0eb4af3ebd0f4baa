//! Exact ordering of decimal price strings
//!
//! Exchange prices arrive as strings that may carry more precision than an
//! `f64` can hold, so levels are ordered by comparing digits directly and
//! never by converting to binary floating point.

use std::cmp::Ordering;

/// A decimal string split into sign, integer digits and fractional digits.
///
/// Leading zeros of the integer part and trailing zeros of the fraction are
/// stripped, so two spellings of the same value split identically.
struct Parts<'a> {
    negative: bool,
    int: &'a str,
    frac: &'a str,
}

fn split(raw: &str) -> Parts<'_> {
    let raw = raw.trim();
    let (negative, body) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };

    let (int, frac) = body.split_once('.').unwrap_or((body, ""));
    let int = int.trim_start_matches('0');
    let frac = frac.trim_end_matches('0');

    Parts {
        // "-0" and "-0.000" are zero, not negative
        negative: negative && !(int.is_empty() && frac.is_empty()),
        int: if int.is_empty() { "0" } else { int },
        frac,
    }
}

fn padded(digits: &str, width: usize) -> impl Iterator<Item = u8> + '_ {
    digits.bytes().chain(std::iter::repeat(b'0')).take(width)
}

fn magnitude(a: &Parts<'_>, b: &Parts<'_>) -> Ordering {
    a.int
        .len()
        .cmp(&b.int.len())
        .then_with(|| a.int.cmp(b.int))
        .then_with(|| {
            let width = a.frac.len().max(b.frac.len());
            padded(a.frac, width).cmp(padded(b.frac, width))
        })
}

/// Compare two decimal strings by numeric value.
///
/// `compare("100.50", "100.5")` is `Equal`; `compare("99", "100")` is `Less`.
pub fn compare(a: &str, b: &str) -> Ordering {
    let (a, b) = (split(a), split(b));
    match (a.negative, b.negative) {
        (false, true) => Ordering::Greater,
        (true, false) => Ordering::Less,
        (false, false) => magnitude(&a, &b),
        (true, true) => magnitude(&b, &a),
    }
}

/// True when the string denotes zero ("0", "0.000", "-0", "").
pub fn is_zero(raw: &str) -> bool {
    let parts = split(raw);
    parts.int == "0" && parts.frac.is_empty()
}

//! End-to-end order book scenarios driven through the public API.

use pushfeed_book::{canonical_string, checksum, Action, BookData, BookError, Level, OrderBookStore};

/// CRC32 (IEEE) of the scenario's canonical strings, as signed 32-bit.
const SNAPSHOT_CHECKSUM: i32 = 97597700;
const AFTER_DELTA_CHECKSUM: i32 = -665260576;

fn levels(raw: &[(&str, &str)]) -> Vec<Level> {
    raw.iter().map(|(p, s)| Level::new(*p, *s)).collect()
}

fn parse(json: &str) -> BookData {
    serde_json::from_str(json).expect("valid book payload")
}

#[test]
fn test_snapshot_then_delta_scenario() {
    let snap_bids = levels(&[("100", "1"), ("99.5", "2"), ("99", "3")]);
    let snap_asks = levels(&[("101", "1"), ("101.5", "2"), ("102", "3")]);
    assert_eq!(
        canonical_string(&snap_bids, &snap_asks),
        "100:1:101:1:99.5:2:101.5:2:99:3:102:3"
    );
    let snap_checksum = checksum(&snap_bids, &snap_asks);
    assert_eq!(snap_checksum, SNAPSHOT_CHECKSUM);

    let snapshot = parse(&format!(
        r#"{{"bids":[["100","1","0","1"],["99.5","2","0","1"],["99","3","0","1"]],
            "asks":[["101","1","0","1"],["101.5","2","0","1"],["102","3","0","1"]],
            "ts":"1700000000000","checksum":{},"prevSeqId":-1,"seqId":10}}"#,
        SNAPSHOT_CHECKSUM
    ));

    let mut store = OrderBookStore::new();
    let action = store
        .apply("books", "BTC-USDT", Some(Action::Snapshot), &snapshot)
        .unwrap();
    assert_eq!(action, Action::Snapshot);
    assert!(store.is_ready());
    assert_eq!(store.last_checksum(), snap_checksum);

    let after_bids = levels(&[("100", "1"), ("99.8", "5"), ("99", "3")]);
    let after_asks = levels(&[("101", "1"), ("101.5", "7")]);
    assert_eq!(
        canonical_string(&after_bids, &after_asks),
        "100:1:101:1:99.8:5:101.5:7:99:3"
    );
    assert_eq!(checksum(&after_bids, &after_asks), AFTER_DELTA_CHECKSUM);
    let delta = parse(&format!(
        r#"{{"bids":[["99.8","5","0","1"],["99.5","0","0","0"]],
            "asks":[["101.5","7","0","2"],["102","0","0","0"]],
            "ts":"1700000000100","checksum":{},"prevSeqId":10,"seqId":15}}"#,
        AFTER_DELTA_CHECKSUM
    ));
    let action = store
        .apply("books", "BTC-USDT", Some(Action::Update), &delta)
        .unwrap();
    assert_eq!(action, Action::Update);

    let book = store.snapshot().expect("book is ready");
    let bid_prices: Vec<&str> = book.bids.iter().map(|l| l.price.as_str()).collect();
    let ask_prices: Vec<&str> = book.asks.iter().map(|l| l.price.as_str()).collect();
    assert_eq!(bid_prices, vec!["100", "99.8", "99"]);
    assert_eq!(ask_prices, vec!["101", "101.5"]);
    assert_eq!(book.asks[1].size, "7");
    assert_eq!(book.seq_id, 15);
    assert_eq!(book.checksum, AFTER_DELTA_CHECKSUM);
    assert_eq!(book.ts, "1700000000100");
    assert_eq!(book.best_bid().map(|l| l.price.as_str()), Some("100"));
    assert_eq!(book.best_ask().map(|l| l.price.as_str()), Some("101"));
}

#[test]
fn test_in_order_deltas_never_reset() {
    let mut store = OrderBookStore::new();
    let snapshot = BookData {
        bids: levels(&[("100", "1")]),
        asks: levels(&[("200", "1")]),
        prev_seq_id: -1,
        seq_id: 1,
        ..BookData::default()
    };
    store.apply("books", "ETH-USDT", None, &snapshot).unwrap();

    for seq in 1..50i64 {
        let bid = format!("{}", 100 - seq);
        let ask = format!("{}", 200 + seq);
        let delta = BookData {
            bids: levels(&[(bid.as_str(), "1")]),
            asks: levels(&[(ask.as_str(), "2")]),
            prev_seq_id: seq,
            seq_id: seq + 1,
            ..BookData::default()
        };
        store.apply("books", "ETH-USDT", None, &delta).unwrap();
        assert!(store.is_ready());
    }
    assert_eq!(store.bids().len(), 50);
    assert_eq!(store.asks().len(), 50);
    assert_eq!(store.seq_id(), 50);
}

#[test]
fn test_out_of_order_delta_always_resets() {
    let mut store = OrderBookStore::new();
    let snapshot = BookData {
        bids: levels(&[("100", "1")]),
        asks: levels(&[("200", "1")]),
        seq_id: 5,
        ..BookData::default()
    };

    for bad_prev in [1i64, 4, 6, 100, -1] {
        store.apply("books", "ETH-USDT", None, &snapshot).unwrap();
        let delta = BookData {
            bids: levels(&[("99", "1")]),
            prev_seq_id: bad_prev,
            seq_id: 7,
            ..BookData::default()
        };
        let err = store.apply("books", "ETH-USDT", None, &delta).unwrap_err();
        assert!(matches!(err, BookError::SequenceGap { .. }), "prev {}", bad_prev);
        assert!(!store.is_ready());
    }
}

#[test]
fn test_verification_error_reports_identity() {
    let mut store = OrderBookStore::new();
    let snapshot = BookData {
        bids: levels(&[("100", "1")]),
        asks: levels(&[("200", "1")]),
        seq_id: 5,
        ..BookData::default()
    };
    store.apply("books-l2-tbt", "SOL-USDT", None, &snapshot).unwrap();

    let delta = BookData {
        prev_seq_id: 4,
        seq_id: 6,
        ..BookData::default()
    };
    let err = store.apply("books-l2-tbt", "SOL-USDT", None, &delta).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("books-l2-tbt/SOL-USDT"));
    assert!(message.contains("expected prevSeqId 5, got 4"));
    assert_eq!(err.reason(), "sequence");
}

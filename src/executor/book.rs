//! CLOB order-book message parsing.
//!
//! The venue mixes book snapshots, heartbeats and error payloads on the same
//! surfaces, so parsing is total: every JSON value maps to exactly one of
//! the tagged variants and unknown shapes collapse to `Err`.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use super::price::DEFAULT_TICK;

/// Top of book plus the venue tick, which is all the pricer consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct BookTop {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub tick_size: Decimal,
}

impl Default for BookTop {
    fn default() -> Self {
        Self {
            best_bid: None,
            best_ask: None,
            tick_size: DEFAULT_TICK,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookMessage {
    Book(BookTop),
    Heartbeat,
    Err(String),
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn level_price(level: &Value) -> Option<Decimal> {
    level.get("price").and_then(value_to_decimal)
}

/// Total parse of one book-shaped message.
pub fn parse_book_message(value: &Value) -> BookMessage {
    if let Some(event) = value.get("event_type").or_else(|| value.get("type")) {
        let tag = event.as_str().unwrap_or_default().to_ascii_lowercase();
        if tag == "heartbeat" || tag == "pong" {
            return BookMessage::Heartbeat;
        }
    }
    if let Some(error) = value.get("error") {
        let reason = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return BookMessage::Err(reason);
    }

    let (Some(bids), Some(asks)) = (
        value.get("bids").and_then(Value::as_array),
        value.get("asks").and_then(Value::as_array),
    ) else {
        return BookMessage::Err("unrecognized book shape".into());
    };

    // Levels are not trusted to arrive sorted.
    let best_bid = bids.iter().filter_map(level_price).max();
    let best_ask = asks.iter().filter_map(level_price).min();
    let tick_size = value
        .get("tick_size")
        .and_then(value_to_decimal)
        .filter(|t| *t > Decimal::ZERO)
        .unwrap_or(DEFAULT_TICK);

    BookMessage::Book(BookTop {
        best_bid,
        best_ask,
        tick_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn parses_snapshot_with_string_levels() {
        let msg = json!({
            "market": "0xabc",
            "bids": [
                {"price": "0.48", "size": "120"},
                {"price": "0.51", "size": "44"},
                {"price": "0.50", "size": "10"}
            ],
            "asks": [
                {"price": "0.55", "size": "80"},
                {"price": "0.53", "size": "15"}
            ],
            "tick_size": "0.001"
        });
        let BookMessage::Book(top) = parse_book_message(&msg) else {
            panic!("expected book");
        };
        assert_eq!(top.best_bid, Some(dec("0.51")));
        assert_eq!(top.best_ask, Some(dec("0.53")));
        assert_eq!(top.tick_size, dec("0.001"));
    }

    #[test]
    fn numeric_tick_and_empty_sides() {
        let msg = json!({"bids": [], "asks": [], "tick_size": 0.01});
        let BookMessage::Book(top) = parse_book_message(&msg) else {
            panic!("expected book");
        };
        assert_eq!(top.best_bid, None);
        assert_eq!(top.best_ask, None);
        assert_eq!(top.tick_size, dec("0.01"));
    }

    #[test]
    fn missing_tick_falls_back() {
        let msg = json!({"bids": [{"price": "0.4", "size": "1"}], "asks": []});
        let BookMessage::Book(top) = parse_book_message(&msg) else {
            panic!("expected book");
        };
        assert_eq!(top.tick_size, DEFAULT_TICK);
    }

    #[test]
    fn heartbeat_and_error_variants() {
        assert_eq!(
            parse_book_message(&json!({"event_type": "heartbeat"})),
            BookMessage::Heartbeat
        );
        assert_eq!(
            parse_book_message(&json!({"type": "PONG"})),
            BookMessage::Heartbeat
        );
        assert!(matches!(
            parse_book_message(&json!({"error": "market not found"})),
            BookMessage::Err(reason) if reason == "market not found"
        ));
        assert!(matches!(
            parse_book_message(&json!({"something": "else"})),
            BookMessage::Err(_)
        ));
        assert!(matches!(parse_book_message(&json!(42)), BookMessage::Err(_)));
    }

    #[test]
    fn parse_is_stable_across_reserialization() {
        let msg = json!({
            "bids": [{"price": "0.48", "size": "120"}],
            "asks": [{"price": "0.53", "size": "15"}],
            "tick_size": "0.01"
        });
        let first = parse_book_message(&msg);
        let round_tripped: Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        let second = parse_book_message(&round_tripped);
        assert_eq!(first, second);
    }
}

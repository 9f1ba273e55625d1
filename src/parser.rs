//! Ticker parser.
//!
//! Normalises the wildly heterogeneous raw ticker payloads the upstream
//! venues produce into one canonical batch: `"BASE-QUOTE"` (uppercased) to
//! [`Ticker`]. Base and quote are resolved by a fixed rule chain; numeric
//! fields default to 0 when missing or null. Malformed entries never fail a
//! run, they are skipped and counted.

use crate::models::{RawTicker, RawTickerMap, Ticker, TickerBatch};
use serde_json::Value;
use tracing::debug;

const SEPARATORS: [char; 3] = ['/', '-', '_'];

/// Parse a raw upstream payload into a canonical batch for one exchange.
///
/// Entries whose base and quote cannot be resolved are dropped; collisions
/// on the canonical name are won by the later entry.
pub fn parse_market_data(data: &RawTickerMap, exchange_id: i64) -> TickerBatch {
    let mut batch = TickerBatch::new();
    let mut dropped = 0usize;
    for (key, raw) in data {
        let Some((base, quote)) = resolve_pair(key, raw) else {
            debug!(key, "could not resolve base and quote, skipping entry");
            dropped += 1;
            continue;
        };
        let base = base.to_uppercase();
        let quote = quote.to_uppercase();
        let name = format!("{}-{}", base, quote);
        batch.insert(
            name,
            Ticker {
                base,
                quote,
                last: num(&raw.last),
                bid: num(&raw.bid),
                ask: num(&raw.ask),
                open: num(&raw.open),
                close: num(&raw.close),
                high: num(&raw.high),
                low: num(&raw.low),
                volume: num(&raw.base_volume),
                exchange_id,
            },
        );
    }
    if dropped > 0 {
        debug!(dropped, "dropped unresolvable ticker entries");
    }
    batch
}

/// Resolution order: the record itself, then its `info` sub-record, then the
/// upstream key split on `/`.
fn resolve_pair(key: &str, raw: &RawTicker) -> Option<(String, String)> {
    if let Some(pair) = resolve_from_record(&RecordView::Ticker(raw)) {
        return Some(pair);
    }
    if let Some(info) = &raw.info {
        if let Some(pair) = resolve_from_record(&RecordView::Info(info)) {
            return Some(pair);
        }
    }
    split_pair(key, '/')
}

/// A uniform string-field view over the typed record and its raw `info`
/// object.
enum RecordView<'a> {
    Ticker(&'a RawTicker),
    Info(&'a Value),
}

impl RecordView<'_> {
    fn get(&self, field: &str) -> Option<&str> {
        let value = match self {
            RecordView::Ticker(raw) => match field {
                "symbol" => raw.symbol.as_ref(),
                "market" => raw.market.as_ref(),
                "name" => raw.name.as_ref(),
                "underlying" => raw.underlying.as_ref(),
                _ => None,
            },
            RecordView::Info(info) => info.get(field),
        };
        value.and_then(Value::as_str).filter(|s| !s.is_empty())
    }
}

fn resolve_from_record(view: &RecordView<'_>) -> Option<(String, String)> {
    // Some venues (FTX-style derivatives) publish no quote at all, only the
    // underlying plus a composite name such as "THETA-PERP". The underlying
    // is the quote; the rest of the name is the base.
    if let (Some(underlying), Some(name)) = (view.get("underlying"), view.get("name")) {
        if let Some(pair) = split_on_underlying(name, underlying) {
            return Some(pair);
        }
    }
    for field in ["symbol", "market", "name"] {
        if let Some(candidate) = view.get(field) {
            if let Some(sep) = first_separator(candidate) {
                if let Some(pair) = split_pair(candidate, sep) {
                    return Some(pair);
                }
            }
        }
    }
    None
}

fn split_on_underlying(name: &str, underlying: &str) -> Option<(String, String)> {
    let start = name.find(underlying)?;
    first_separator(name)?;
    let base = if start == 0 {
        name.get(underlying.len() + 1..)?
    } else {
        name.get(..start.checked_sub(1)?)?
    };
    if base.is_empty() {
        return None;
    }
    Some((base.to_string(), underlying.to_string()))
}

/// Separators are tried in a fixed priority order, not by position.
fn first_separator(s: &str) -> Option<char> {
    SEPARATORS.iter().copied().find(|&sep| s.contains(sep))
}

/// Split into exactly two non-empty parts, `(base, quote)`.
fn split_pair(s: &str, sep: char) -> Option<(String, String)> {
    let mut parts = s.split(sep);
    let base = parts.next()?.trim();
    let quote = parts.next()?.trim();
    if base.is_empty() || quote.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((base.to_string(), quote.to_string()))
}

/// Missing, null, or unparseable numerics default to 0.
fn num(value: &Option<Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawTicker {
        serde_json::from_value(value).unwrap()
    }

    fn batch_of(entries: Vec<(&str, Value)>) -> TickerBatch {
        let map: RawTickerMap = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), raw(v)))
            .collect();
        parse_market_data(&map, 1)
    }

    #[test]
    fn splits_symbol_field_on_slash() {
        let batch = batch_of(vec![(
            "ignored",
            json!({"symbol": "ETH/BTC", "last": 0.06, "baseVolume": 100}),
        )]);
        let t = &batch["ETH-BTC"];
        assert_eq!(t.base, "ETH");
        assert_eq!(t.quote, "BTC");
        assert_eq!(t.last, 0.06);
        assert_eq!(t.volume, 100.0);
    }

    #[test]
    fn falls_back_to_info_symbol_with_underscore() {
        let batch = batch_of(vec![("WEIRD", json!({"info": {"symbol": "a_b"}}))]);
        assert_eq!(batch.len(), 1);
        let t = &batch["A-B"];
        assert_eq!(t.base, "A");
        assert_eq!(t.quote, "B");
        assert_eq!(t.last, 0.0);
        assert_eq!(t.bid, 0.0);
        assert_eq!(t.volume, 0.0);
    }

    #[test]
    fn falls_back_to_key_split() {
        let batch = batch_of(vec![("ltc/usd", json!({"last": 80}))]);
        assert!(batch.contains_key("LTC-USD"));
    }

    #[test]
    fn unresolvable_entry_is_dropped() {
        let batch = batch_of(vec![("NOSEPARATOR", json!({"last": 1}))]);
        assert!(batch.is_empty());
    }

    #[test]
    fn underlying_as_suffix_makes_the_prefix_the_base() {
        let batch = batch_of(vec![(
            "THETA-PERP",
            json!({"name": "THETA-PERP", "underlying": "THETA", "last": 1.2}),
        )]);
        assert_eq!(batch.len(), 1);
        let t = &batch["PERP-THETA"];
        assert_eq!(t.base, "PERP");
        assert_eq!(t.quote, "THETA");
    }

    #[test]
    fn underlying_in_the_middle_keeps_the_leading_base() {
        let batch = batch_of(vec![(
            "XYZ-THETA",
            json!({"name": "XYZ-THETA", "underlying": "THETA"}),
        )]);
        let t = &batch["XYZ-THETA"];
        assert_eq!(t.base, "XYZ");
        assert_eq!(t.quote, "THETA");
    }

    #[test]
    fn underlying_inside_info_is_honoured() {
        let batch = batch_of(vec![(
            "BTC-PERP",
            json!({"info": {"name": "BTC-PERP", "underlying": "BTC"}}),
        )]);
        assert!(batch.contains_key("PERP-BTC"));
    }

    #[test]
    fn numeric_strings_are_coerced_and_nulls_default() {
        let batch = batch_of(vec![(
            "BTC/USD",
            json!({
                "symbol": "BTC/USD",
                "last": "30000.5",
                "bid": null,
                "baseVolume": 12
            }),
        )]);
        let t = &batch["BTC-USD"];
        assert_eq!(t.last, 30000.5);
        assert_eq!(t.bid, 0.0);
        assert_eq!(t.volume, 12.0);
    }

    #[test]
    fn later_entries_win_name_collisions() {
        let mut map = RawTickerMap::new();
        map.insert(
            "a".into(),
            raw(json!({"symbol": "ETH/BTC", "last": 1})),
        );
        map.insert(
            "b".into(),
            raw(json!({"symbol": "ETH-BTC", "last": 2})),
        );
        let batch = parse_market_data(&map, 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch["ETH-BTC"].last, 2.0);
    }

    #[test]
    fn separator_priority_prefers_slash() {
        let batch = batch_of(vec![("x", json!({"symbol": "A_B/C"}))]);
        // '/' outranks '_', and a two-way split on '/' gives A_B : C.
        assert!(batch.contains_key("A_B-C"));
    }

    #[test]
    fn canonical_name_is_uppercased() {
        let batch = batch_of(vec![("eth/btc", json!({}))]);
        assert!(batch.contains_key("ETH-BTC"));
    }

    #[test]
    fn arbitrary_value_shapes_never_panic() {
        let batch = batch_of(vec![
            ("k1", json!({"symbol": 42, "last": [1, 2]})),
            ("k2", json!({"info": "not-an-object"})),
            ("k3/q", json!({"name": {"nested": true}, "last": {"x": 1}})),
        ]);
        // Only k3/q resolves, via the key fallback.
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key("K3-Q"));
        assert_eq!(batch["K3-Q"].last, 0.0);
    }
}

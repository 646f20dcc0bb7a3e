//! CLOB order-book source: on-demand top-of-book per outcome token.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::BookSnapshot;

pub const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Book fetches sit in the hot path; keep the budget tick-sized.
const BOOK_TIMEOUT: Duration = Duration::from_millis(500);

/// Top-of-book access for one token. Implemented by the CLOB REST client and
/// by test stubs.
#[async_trait::async_trait]
pub trait BookSource: Send + Sync {
    /// Fails with an empty-book error when both sides are empty.
    async fn book(&self, token_id: &str) -> Result<BookSnapshot>;
}

/// CLOB levels come over the wire as decimal strings.
#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

fn parse_level(level: &RawLevel) -> Option<(f64, f64)> {
    let price = level.price.parse::<f64>().ok()?;
    let size = level.size.parse::<f64>().ok()?;
    (price.is_finite() && price > 0.0 && size.is_finite() && size > 0.0).then_some((price, size))
}

fn snapshot_from(raw: &RawBook, token_id: &str, observed_at_ms: i64) -> Result<BookSnapshot> {
    // Level ordering differs between venue endpoints; pick the touch by value.
    let best_ask = raw
        .asks
        .iter()
        .filter_map(parse_level)
        .min_by(|a, b| a.0.total_cmp(&b.0));
    let best_bid = raw
        .bids
        .iter()
        .filter_map(parse_level)
        .max_by(|a, b| a.0.total_cmp(&b.0));

    if best_ask.is_none() && best_bid.is_none() {
        bail!("empty book for token {token_id}");
    }

    let (ask, ask_size) = best_ask.unwrap_or((0.0, 0.0));
    let (bid, bid_size) = best_bid.unwrap_or((0.0, 0.0));

    Ok(BookSnapshot {
        best_ask: ask,
        best_bid: bid,
        ask_size,
        bid_size,
        observed_at_ms,
    })
}

/// REST client for the CLOB `/book` endpoint.
#[derive(Debug, Clone)]
pub struct ClobBookClient {
    client: Client,
    base: String,
}

impl ClobBookClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base: CLOB_API_BASE.to_string(),
        }
    }

    pub fn with_base(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait::async_trait]
impl BookSource for ClobBookClient {
    async fn book(&self, token_id: &str) -> Result<BookSnapshot> {
        let raw: RawBook = self
            .client
            .get(format!("{}/book", self.base))
            .query(&[("token_id", token_id)])
            .timeout(BOOK_TIMEOUT)
            .send()
            .await
            .context("book request failed")?
            .error_for_status()
            .context("book request status")?
            .json()
            .await
            .context("book response parse")?;

        snapshot_from(&raw, token_id, Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawBook {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn picks_touch_by_value_regardless_of_order() {
        let book = raw(
            r#"{
                "bids": [{"price":"0.64","size":"10"},{"price":"0.66","size":"5"}],
                "asks": [{"price":"0.70","size":"3"},{"price":"0.68","size":"7"}]
            }"#,
        );
        let snap = snapshot_from(&book, "tok", 1).unwrap();
        assert_eq!(snap.best_ask, 0.68);
        assert_eq!(snap.ask_size, 7.0);
        assert_eq!(snap.best_bid, 0.66);
        assert_eq!(snap.bid_size, 5.0);
        assert_eq!(snap.spread(), Some(0.68 - 0.66));
    }

    #[test]
    fn both_sides_empty_is_an_error() {
        let book = raw(r#"{"bids": [], "asks": []}"#);
        assert!(snapshot_from(&book, "tok", 1).is_err());
    }

    #[test]
    fn partial_book_tolerated_with_zero_side() {
        let book = raw(r#"{"bids": [], "asks": [{"price":"0.70","size":"3"}]}"#);
        let snap = snapshot_from(&book, "tok", 1).unwrap();
        assert_eq!(snap.best_ask, 0.70);
        assert_eq!(snap.best_bid, 0.0);
        assert!(!snap.has_bid());
        assert_eq!(snap.spread(), None);
    }

    #[test]
    fn malformed_levels_skipped() {
        let book = raw(
            r#"{
                "bids": [{"price":"junk","size":"10"},{"price":"0.61","size":"2"}],
                "asks": [{"price":"0.70","size":"0"}]
            }"#,
        );
        let snap = snapshot_from(&book, "tok", 1).unwrap();
        assert_eq!(snap.best_bid, 0.61);
        // Zero-size ask level does not count as a side.
        assert!(!snap.has_ask());
    }
}

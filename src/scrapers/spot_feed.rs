//! Live spot-price feed over the venue's real-time data websocket.
//!
//! Single writer (the socket task), many readers. Consumers read the last
//! cached value and never block on the socket; until the first price arrives
//! `latest()` reports not-ready and the strategy skips the tick.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Asset;

pub const RTDS_WSS_URL: &str = "wss://ws-live-data.polymarket.com";

const PRICE_TOPIC: &str = "crypto_prices";

#[derive(Debug, Clone, Copy)]
pub struct SpotPoint {
    pub price: f64,
    /// Source timestamp, unix millis.
    pub ts_ms: i64,
}

#[derive(Debug, Default)]
struct FeedState {
    latest: Option<SpotPoint>,
    /// First sample of the historical dump sent on subscribe; usable as the
    /// window's strike reference when the authoritative endpoint lags.
    strike_hint: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SpotSample {
    #[serde(default)]
    timestamp: i64,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct SpotPayload {
    symbol: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    data: Vec<SpotSample>,
}

/// Read side of the spot stream: the last cached price, non-blocking.
pub trait SpotSource: Send + Sync {
    /// Fails until the first price has been observed.
    fn latest(&self) -> Result<SpotPoint>;
    fn ready(&self) -> bool;
}

/// Handle to the spot stream worker.
pub struct SpotFeed {
    state: Arc<RwLock<FeedState>>,
    shutdown: Arc<AtomicBool>,
    symbol: &'static str,
}

impl SpotFeed {
    /// Spawn the websocket worker and return the shared handle.
    pub fn spawn(asset: Asset) -> Arc<Self> {
        let feed = Arc::new(Self {
            state: Arc::new(RwLock::new(FeedState::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            symbol: asset.stream_symbol(),
        });

        let worker = feed.clone();
        tokio::spawn(async move {
            worker.run().await;
        });

        feed
    }

    /// Handle for tests: no socket task, fed through `apply_message`.
    #[cfg(test)]
    fn detached(asset: Asset) -> Self {
        Self {
            state: Arc::new(RwLock::new(FeedState::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            symbol: asset.stream_symbol(),
        }
    }

    /// Window-open price remembered from the subscribe-time history dump.
    pub fn strike_hint(&self) -> Option<f64> {
        self.state.read().strike_hint
    }

    /// Stop reconnecting and let the worker exit. Cached values stay readable.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn latest_point(&self) -> Option<SpotPoint> {
        self.state.read().latest
    }

    async fn run(self: Arc<Self>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.connect_and_stream().await {
                Ok(_) => {
                    reconnect_delay = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, "spot stream disconnected; reconnecting");
                    sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
        info!("spot feed worker stopped");
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!(symbol = self.symbol, "connecting to spot stream");
        let (ws_stream, resp) = connect_async(RTDS_WSS_URL)
            .await
            .context("connect_async spot stream")?;
        info!(status = %resp.status(), "spot stream connected");

        let (mut write, mut read) = ws_stream.split();

        let sub_msg = serde_json::json!({
            "action": "subscribe",
            "subscriptions": [{
                "topic": PRICE_TOPIC,
                "type": "update",
                "filters": format!("{{\"symbol\":\"{}\"}}", self.symbol),
            }],
        });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .context("send spot subscription")?;

        let mut ping = interval(Duration::from_secs(5));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }

            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text("PING".to_string())).await;
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("spot stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            self.apply_message(&text);
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "spot stream close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow!("spot stream error: {e}"));
                        }
                    }
                }
            }
        }
    }

    /// Apply one raw stream message. Accepts a single-point update
    /// (`{symbol, timestamp, value}`) or the historical dump sent on
    /// subscribe (`{symbol, data: [...]}`); everything else is ignored.
    fn apply_message(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return;
        };

        // Topic-tagged envelopes must tag the price stream.
        if let Some(topic) = value.get("topic").and_then(Value::as_str) {
            if topic != PRICE_TOPIC {
                return;
            }
        }

        let payload = value.get("payload").unwrap_or(&value);
        let Ok(payload) = serde_json::from_value::<SpotPayload>(payload.clone()) else {
            return;
        };
        if !payload.symbol.eq_ignore_ascii_case(self.symbol) {
            return;
        }

        let mut state = self.state.write();

        if !payload.data.is_empty() {
            if state.strike_hint.is_none() {
                if let Some(first) = payload.data.iter().find(|s| s.value > 0.0) {
                    state.strike_hint = Some(first.value);
                }
            }
            if let Some(last) = payload.data.iter().rev().find(|s| s.value > 0.0) {
                state.latest = Some(SpotPoint {
                    price: last.value,
                    ts_ms: last.timestamp,
                });
            }
            return;
        }

        if let Some(v) = payload.value {
            if v > 0.0 {
                state.latest = Some(SpotPoint {
                    price: v,
                    ts_ms: payload.timestamp.unwrap_or_default(),
                });
            }
        }
    }
}

impl SpotSource for SpotFeed {
    fn latest(&self) -> Result<SpotPoint> {
        self.latest_point()
            .ok_or_else(|| anyhow!("spot feed not ready"))
    }

    fn ready(&self) -> bool {
        self.latest_point().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_point_update() {
        let feed = SpotFeed::detached(Asset::Btc);
        assert!(!feed.ready());
        assert!(feed.latest().is_err());

        feed.apply_message(
            r#"{"topic":"crypto_prices","payload":{"symbol":"btc/usd","timestamp":1700000000000,"value":89800.5}}"#,
        );
        assert!(feed.ready());
        let p = feed.latest().unwrap();
        assert_eq!(p.price, 89800.5);
        assert_eq!(p.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn bare_payload_without_envelope() {
        let feed = SpotFeed::detached(Asset::Btc);
        feed.apply_message(r#"{"symbol":"btc/usd","timestamp":5,"value":90000.0}"#);
        assert_eq!(feed.latest().unwrap().price, 90000.0);
    }

    #[test]
    fn other_symbols_and_topics_ignored() {
        let feed = SpotFeed::detached(Asset::Btc);
        feed.apply_message(
            r#"{"topic":"crypto_prices","payload":{"symbol":"eth/usd","timestamp":1,"value":3000.0}}"#,
        );
        feed.apply_message(
            r#"{"topic":"comments","payload":{"symbol":"btc/usd","timestamp":1,"value":1.0}}"#,
        );
        assert!(!feed.ready());
    }

    #[test]
    fn non_positive_values_ignored() {
        let feed = SpotFeed::detached(Asset::Btc);
        feed.apply_message(r#"{"symbol":"btc/usd","timestamp":1,"value":0.0}"#);
        feed.apply_message(r#"{"symbol":"btc/usd","timestamp":2,"value":-5.0}"#);
        assert!(!feed.ready());
    }

    #[test]
    fn history_dump_takes_last_and_remembers_first() {
        let feed = SpotFeed::detached(Asset::Btc);
        feed.apply_message(
            r#"{"topic":"crypto_prices","payload":{"symbol":"btc/usd","data":[
                {"timestamp":1,"value":89750.0},
                {"timestamp":2,"value":89780.0},
                {"timestamp":3,"value":89810.0}
            ]}}"#,
        );
        assert_eq!(feed.latest().unwrap().price, 89810.0);
        assert_eq!(feed.strike_hint(), Some(89750.0));

        // A later dump does not overwrite the remembered strike reference.
        feed.apply_message(
            r#"{"symbol":"btc/usd","data":[{"timestamp":4,"value":90000.0}]}"#,
        );
        assert_eq!(feed.strike_hint(), Some(89750.0));
        assert_eq!(feed.latest().unwrap().price, 90000.0);
    }

    #[test]
    fn garbage_is_ignored() {
        let feed = SpotFeed::detached(Asset::Btc);
        feed.apply_message("not json");
        feed.apply_message(r#"{"unrelated": true}"#);
        assert!(!feed.ready());
    }
}

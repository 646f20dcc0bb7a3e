//! Live execution against the venue CLOB.
//!
//! Credentials are negotiated lazily at first use behind a mutex; request
//! authentication is L2 HMAC over `timestamp + method + path + body`. The
//! gateway keeps a local order set and position mirror so both execution
//! backends expose one contract; wallet introspection stays out of scope and
//! the cash mirror starts from the configured bankroll.

use anyhow::{anyhow, bail, Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::gateway::{ExecutionGateway, Fill, OpenOrder, POSITION_EPSILON};
use crate::models::{OrderSide, Position, TimeInForce};

pub const CLOB_HOST: &str = "https://clob.polymarket.com";

type HmacSha256 = Hmac<Sha256>;

/// L2 API credentials.
#[derive(Debug, Clone)]
pub struct ClobCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
    pub address: String,
}

/// Narrow seam for credential derivation; key management and L1 signature
/// construction live outside this crate.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn derive(&self) -> Result<ClobCredentials>;
}

/// Provider backed by operator-supplied environment credentials.
pub struct EnvCredentialProvider;

#[async_trait::async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn derive(&self) -> Result<ClobCredentials> {
        let api_key = std::env::var("POLYMARKET_CLOB_API_KEY")
            .context("POLYMARKET_CLOB_API_KEY not set")?;
        let secret = std::env::var("POLYMARKET_CLOB_SECRET")
            .context("POLYMARKET_CLOB_SECRET not set")?;
        let passphrase = std::env::var("POLYMARKET_CLOB_PASSPHRASE")
            .context("POLYMARKET_CLOB_PASSPHRASE not set")?;
        let address = std::env::var("POLYMARKET_WALLET_ADDRESS").unwrap_or_default();

        if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
            bail!("incomplete CLOB credentials");
        }
        Ok(ClobCredentials {
            api_key,
            secret,
            passphrase,
            address,
        })
    }
}

#[derive(Debug, Serialize)]
struct ClobOrderPayload {
    #[serde(rename = "tokenID")]
    token_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(rename = "orderType")]
    order_type: String,
    #[serde(rename = "timeInForce")]
    time_in_force: String,
    #[serde(rename = "expiration", skip_serializing_if = "Option::is_none")]
    expiration: Option<i64>,
    #[serde(rename = "feeRateBps")]
    fee_rate_bps: String,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
struct ClobOrderResponse {
    #[serde(rename = "orderID", alias = "orderId", alias = "order_id")]
    order_id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "errorMsg", alias = "error", default)]
    error_msg: Option<String>,
    #[serde(rename = "filledSize", alias = "filled_size", default)]
    filled_size: Option<String>,
    #[serde(rename = "avgPrice", alias = "avg_price", default)]
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClobOpenOrder {
    #[serde(rename = "orderID", alias = "id", default)]
    order_id: String,
}

#[derive(Debug, Default)]
struct LiveState {
    cash: f64,
    positions: HashMap<String, Position>,
    open_orders: HashMap<String, OpenOrder>,
    fills: HashMap<String, Fill>,
}

pub struct LiveGateway {
    client: Client,
    host: String,
    provider: Box<dyn CredentialProvider>,
    /// Lazily derived, at most once; the mutex serializes first use.
    creds: tokio::sync::Mutex<Option<ClobCredentials>>,
    state: Mutex<LiveState>,
}

impl std::fmt::Debug for LiveGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveGateway")
            .field("host", &self.host)
            .field("creds", &"[REDACTED]")
            .finish()
    }
}

impl LiveGateway {
    pub fn new(client: Client, provider: Box<dyn CredentialProvider>, bankroll: f64) -> Self {
        Self {
            client,
            host: CLOB_HOST.to_string(),
            provider,
            creds: tokio::sync::Mutex::new(None),
            state: Mutex::new(LiveState {
                cash: bankroll,
                ..Default::default()
            }),
        }
    }

    async fn credentials(&self) -> Result<ClobCredentials> {
        let mut slot = self.creds.lock().await;
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let derived = self.provider.derive().await?;
        info!("CLOB credentials derived");
        *slot = Some(derived.clone());
        Ok(derived)
    }

    fn sign_request(
        creds: &ClobCredentials,
        method: &str,
        path: &str,
        body: &str,
        timestamp: i64,
    ) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let secret_bytes = URL_SAFE
            .decode(&creds.secret)
            .or_else(|_| URL_SAFE_NO_PAD.decode(&creds.secret))
            .or_else(|_| BASE64.decode(&creds.secret))
            .context("failed to decode CLOB secret")?;

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| anyhow!("HMAC key error: {e}"))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    async fn auth_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(String, String)>> {
        let creds = self.credentials().await?;
        let timestamp = Utc::now().timestamp();
        let signature = Self::sign_request(&creds, method, path, body, timestamp)?;

        Ok(vec![
            ("POLY_ADDRESS".to_string(), creds.address.clone()),
            ("POLY_API_KEY".to_string(), creds.api_key.clone()),
            ("POLY_SIGNATURE".to_string(), signature),
            ("POLY_TIMESTAMP".to_string(), timestamp.to_string()),
            ("POLY_PASSPHRASE".to_string(), creds.passphrase.clone()),
        ])
    }

    async fn post_order(&self, payload: &ClobOrderPayload) -> Result<ClobOrderResponse> {
        let body = serde_json::to_string(payload).context("serialize order")?;
        let path = "/order";
        let headers = self.auth_headers("POST", path, &body).await?;

        let mut request = self
            .client
            .post(format!("{}{}", self.host, path))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(10));
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await.context("CLOB request")?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("CLOB order rejected ({status}): {text}");
        }

        let resp: ClobOrderResponse =
            serde_json::from_str(&text).context("parse CLOB response")?;
        if let Some(err) = resp.error_msg.as_deref() {
            if !err.is_empty() {
                bail!("CLOB error: {err}");
            }
        }
        Ok(resp)
    }

    fn apply_buy(state: &mut LiveState, token_id: &str, price: f64, size: f64, ts_ms: i64) {
        state.cash -= price * size;
        let pos = state
            .positions
            .entry(token_id.to_string())
            .or_insert_with(|| Position {
                token_id: token_id.to_string(),
                shares: 0.0,
                avg_price: price,
                entry_ts_ms: ts_ms,
            });
        let new_shares = pos.shares + size;
        pos.avg_price = (pos.avg_price * pos.shares + price * size) / new_shares;
        pos.shares = new_shares;
        pos.entry_ts_ms = ts_ms;
    }

    fn apply_sell(state: &mut LiveState, token_id: &str, price: f64, size: f64) {
        state.cash += price * size;
        if let Some(pos) = state.positions.get_mut(token_id) {
            pos.shares = (pos.shares - size).max(0.0);
            if pos.shares <= POSITION_EPSILON {
                state.positions.remove(token_id);
            }
        }
    }

    fn record_fill(state: &mut LiveState, order_id: &str, token_id: &str, side: OrderSide, price: f64, size: f64) {
        let ts_ms = Utc::now().timestamp_millis();
        match side {
            OrderSide::Buy => Self::apply_buy(state, token_id, price, size, ts_ms),
            OrderSide::Sell => Self::apply_sell(state, token_id, price, size),
        }
        state.fills.insert(
            order_id.to_string(),
            Fill {
                order_id: order_id.to_string(),
                token_id: token_id.to_string(),
                side,
                price,
                size,
                filled_at_ms: ts_ms,
            },
        );
    }
}

#[async_trait::async_trait]
impl ExecutionGateway for LiveGateway {
    async fn place_limit(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        tif: TimeInForce,
    ) -> Result<String> {
        if !(price.is_finite() && price > 0.0 && price < 1.0) {
            bail!("invalid price {price}");
        }
        if !(size.is_finite() && size > 0.0) {
            bail!("invalid size {size}");
        }

        let client_order_id = Uuid::new_v4().to_string();
        let expiration = match tif {
            TimeInForce::Gtd(expiry) => Some(expiry),
            _ => None,
        };
        let payload = ClobOrderPayload {
            token_id: token_id.to_string(),
            price: format!("{price:.4}"),
            size: format!("{size:.6}"),
            side: side.as_str().to_string(),
            order_type: "LIMIT".to_string(),
            time_in_force: tif.venue_code().to_string(),
            expiration,
            fee_rate_bps: "0".to_string(),
            client_order_id: client_order_id.clone(),
        };

        let resp = self.post_order(&payload).await?;
        let order_id = resp
            .order_id
            .unwrap_or_else(|| format!("clob:{client_order_id}"));

        self.state.lock().open_orders.insert(
            order_id.clone(),
            OpenOrder {
                order_id: order_id.clone(),
                token_id: token_id.to_string(),
                side,
                price,
                size,
                tif,
                created_at_ms: Utc::now().timestamp_millis(),
            },
        );
        debug!(order_id = %order_id, token = %token_id, side = side.as_str(), "limit order resting");
        Ok(order_id)
    }

    async fn place_fok(
        &self,
        token_id: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<String> {
        if !(price.is_finite() && price > 0.0 && price < 1.0) {
            bail!("invalid price {price}");
        }
        if !(amount.is_finite() && amount > 0.0) {
            bail!("invalid amount {amount}");
        }

        // Market FOK: amount is monetary for BUY, shares for SELL.
        let size = match side {
            OrderSide::Buy => amount / price,
            OrderSide::Sell => amount,
        };

        let client_order_id = Uuid::new_v4().to_string();
        let payload = ClobOrderPayload {
            token_id: token_id.to_string(),
            price: format!("{price:.4}"),
            size: format!("{size:.6}"),
            side: side.as_str().to_string(),
            order_type: "MARKET".to_string(),
            time_in_force: TimeInForce::Fok.venue_code().to_string(),
            expiration: None,
            fee_rate_bps: "0".to_string(),
            client_order_id: client_order_id.clone(),
        };

        let resp = self.post_order(&payload).await?;
        if !resp.success && resp.status.as_deref() != Some("matched") {
            bail!("FOK not filled: {:?}", resp.status);
        }

        let order_id = resp
            .order_id
            .unwrap_or_else(|| format!("clob:{client_order_id}"));
        let filled_size: f64 = resp
            .filled_size
            .and_then(|s| s.parse().ok())
            .unwrap_or(size);
        let filled_price: f64 = resp.avg_price.and_then(|s| s.parse().ok()).unwrap_or(price);

        let mut state = self.state.lock();
        Self::record_fill(&mut state, &order_id, token_id, side, filled_price, filled_size);
        info!(order_id = %order_id, price = filled_price, size = filled_size, "FOK filled");
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool> {
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        let path = "/order";
        let headers = self.auth_headers("DELETE", path, &body).await?;

        let mut request = self
            .client
            .delete(format!("{}{}", self.host, path))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(10));
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = request.body(body).send().await.context("cancel request")?;
        let cancelled = response.status().is_success();
        if cancelled {
            self.state.lock().open_orders.remove(order_id);
        } else {
            warn!(order_id = %order_id, status = %response.status(), "cancel refused");
        }
        Ok(cancelled)
    }

    async fn execute_fak(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
    ) -> Result<bool> {
        let client_order_id = Uuid::new_v4().to_string();
        let payload = ClobOrderPayload {
            token_id: token_id.to_string(),
            price: format!("{price:.4}"),
            size: format!("{size:.6}"),
            side: side.as_str().to_string(),
            order_type: "MARKET".to_string(),
            time_in_force: TimeInForce::Fak.venue_code().to_string(),
            expiration: None,
            fee_rate_bps: "0".to_string(),
            client_order_id: client_order_id.clone(),
        };

        let resp = match self.post_order(&payload).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "FAK submission failed");
                return Ok(false);
            }
        };

        let filled_size: f64 = resp
            .filled_size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(size);
        if filled_size <= 0.0 {
            return Ok(false);
        }
        let filled_price: f64 = resp
            .avg_price
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(price);
        let order_id = resp
            .order_id
            .unwrap_or_else(|| format!("clob:{client_order_id}"));

        let mut state = self.state.lock();
        Self::record_fill(&mut state, &order_id, token_id, side, filled_price, filled_size);
        Ok(true)
    }

    async fn is_filled(&self, order_id: &str) -> Result<bool> {
        if self.state.lock().fills.contains_key(order_id) {
            return Ok(true);
        }

        // Resting orders are polled on the venue.
        let path = format!("/data/order/{order_id}");
        let headers = self.auth_headers("GET", &path, "").await?;
        let mut request = self
            .client
            .get(format!("{}{}", self.host, path))
            .timeout(Duration::from_secs(5));
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(order_id = %order_id, error = %e, "order status poll failed");
                return Ok(false);
            }
        };
        if !response.status().is_success() {
            return Ok(false);
        }
        let resp: ClobOrderResponse = match response.json().await {
            Ok(r) => r,
            Err(_) => return Ok(false),
        };

        let matched = matches!(resp.status.as_deref(), Some("FILLED") | Some("matched"));
        if matched {
            let mut state = self.state.lock();
            if let Some(order) = state.open_orders.remove(order_id) {
                let price = resp
                    .avg_price
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(order.price);
                let size = resp
                    .filled_size
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(order.size);
                Self::record_fill(&mut state, order_id, &order.token_id, order.side, price, size);
            }
        }
        Ok(matched)
    }

    async fn fill_info(&self, order_id: &str) -> Result<Option<Fill>> {
        Ok(self.state.lock().fills.get(order_id).cloned())
    }

    async fn position(&self, token_id: &str) -> Option<Position> {
        self.state.lock().positions.get(token_id).cloned()
    }

    async fn all_positions(&self) -> Vec<Position> {
        self.state.lock().positions.values().cloned().collect()
    }

    async fn cash(&self) -> f64 {
        self.state.lock().cash
    }

    async fn open_orders(&self) -> Vec<OpenOrder> {
        self.state.lock().open_orders.values().cloned().collect()
    }

    /// Enumerate and cancel every open order on the venue, then drop the
    /// local order set.
    async fn clear_all(&self) -> Result<()> {
        let path = "/data/orders";
        let headers = self.auth_headers("GET", path, "").await?;
        let mut request = self
            .client
            .get(format!("{}{}", self.host, path))
            .timeout(Duration::from_secs(10));
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let venue_orders: Vec<ClobOpenOrder> = match request.send().await {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or_default(),
            _ => Vec::new(),
        };

        let mut ids: Vec<String> = venue_orders
            .into_iter()
            .map(|o| o.order_id)
            .filter(|id| !id.is_empty())
            .collect();
        for local in self.state.lock().open_orders.keys() {
            if !ids.contains(local) {
                ids.push(local.clone());
            }
        }

        for order_id in ids {
            if let Err(e) = self.cancel(&order_id).await {
                warn!(order_id = %order_id, error = %e, "cancel during clear_all failed");
            }
        }
        self.state.lock().open_orders.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ClobCredentials {
        ClobCredentials {
            api_key: "key".into(),
            secret: BASE64.encode(b"super-secret"),
            passphrase: "pass".into(),
            address: "0xabc".into(),
        }
    }

    #[test]
    fn signature_is_stable_and_url_safe() {
        let c = creds();
        let a = LiveGateway::sign_request(&c, "POST", "/order", "{}", 1_700_000_000).unwrap();
        let b = LiveGateway::sign_request(&c, "POST", "/order", "{}", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert!(!a.contains('+') && !a.contains('/'));

        // Any component change alters the signature.
        let other = LiveGateway::sign_request(&c, "GET", "/order", "{}", 1_700_000_000).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn order_payload_wire_shape() {
        let payload = ClobOrderPayload {
            token_id: "123".into(),
            price: "0.6800".into(),
            size: "2.941176".into(),
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            time_in_force: "GTC".into(),
            expiration: None,
            fee_rate_bps: "0".into(),
            client_order_id: "cid".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["tokenID"], "123");
        assert_eq!(json["timeInForce"], "GTC");
        assert!(json.get("expiration").is_none());

        let gtd = ClobOrderPayload {
            expiration: Some(1_700_000_900),
            time_in_force: "GTD".into(),
            ..payload
        };
        let json = serde_json::to_value(&gtd).unwrap();
        assert_eq!(json["expiration"], 1_700_000_900);
    }

    #[test]
    fn response_aliases() {
        let r: ClobOrderResponse = serde_json::from_str(
            r#"{"orderId":"abc","success":true,"filledSize":"2.0","avgPrice":"0.68"}"#,
        )
        .unwrap();
        assert_eq!(r.order_id.as_deref(), Some("abc"));
        assert!(r.success);
        assert_eq!(r.filled_size.as_deref(), Some("2.0"));
    }
}

//! Market discovery: find the active 15-minute UP/DOWN window, resolve its
//! outcome token ids and strike, and advertise the next window.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    config::{Asset, Config},
    models::Market,
};

pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
pub const STRIKE_API_BASE: &str = "https://polymarket.com/api";

/// Window length for the traded series.
pub const WINDOW_S: i64 = 15 * 60;

/// Market probes must not stall rotation.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// The strike endpoint gets a wider budget plus retries.
const STRIKE_TIMEOUT: Duration = Duration::from_secs(5);

const GENERIC_BACKOFF_BASE_MS: i64 = 3_000;
const GENERIC_BACKOFF_CAP_MS: i64 = 30_000;
const RATE_LIMIT_BACKOFF_BASE_MS: i64 = 10_000;
const RATE_LIMIT_BACKOFF_CAP_MS: i64 = 60_000;

/// Gamma returns JSON arrays both as arrays and as JSON-encoded strings
/// (e.g. `"[\"123\",\"456\"]"`).
fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        Value::String(s) => {
            serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom)
        }
        _ => Ok(Vec::new()),
    }
}

fn de_string_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    pub slug: String,
    #[serde(rename = "conditionId", default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(rename = "eventStartTime", default)]
    pub event_start_time: Option<String>,
    #[serde(rename = "startDate", default)]
    pub start_date: Option<String>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(rename = "acceptingOrders", default)]
    pub accepting_orders: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StrikeResponse {
    #[serde(rename = "openPrice", default, deserialize_with = "de_string_f64_opt")]
    open_price: Option<f64>,
}

/// Candidate window end instants around `now`: next, current, previous and
/// the one before that, in probe order.
pub fn candidate_window_ends(now_ts: i64) -> [i64; 4] {
    let base = now_ts - now_ts.rem_euclid(WINDOW_S);
    [base + WINDOW_S, base, base - WINDOW_S, base - 2 * WINDOW_S]
}

pub fn window_slug(asset: Asset, start_ts: i64) -> String {
    format!("{}-updown-15m-{}", asset.as_str(), start_ts)
}

fn parse_iso_ts(raw: &Option<String>) -> Option<i64> {
    raw.as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
}

/// A probed market qualifies iff its window contains `now` and the venue
/// reports it tradable.
fn qualifies(m: &GammaMarket, start_ts: i64, end_ts: i64, now_ts: i64) -> bool {
    start_ts <= now_ts
        && now_ts < end_ts
        && m.active
        && m.accepting_orders
        && !m.closed
        && m.clob_token_ids.len() >= 2
}

#[derive(Debug, Clone, Copy)]
struct StrikeRetry {
    next_attempt_ms: i64,
    backoff_ms: i64,
}

/// Exponential backoff with distinct schedules for generic and rate-limit
/// failures. Retries never terminate; only success or operator override do.
fn backoff_after_failure(prev: Option<StrikeRetry>, rate_limited: bool, now_ms: i64) -> StrikeRetry {
    let (base, cap) = if rate_limited {
        (RATE_LIMIT_BACKOFF_BASE_MS, RATE_LIMIT_BACKOFF_CAP_MS)
    } else {
        (GENERIC_BACKOFF_BASE_MS, GENERIC_BACKOFF_CAP_MS)
    };
    let backoff_ms = match prev {
        Some(r) => (r.backoff_ms * 2).clamp(base, cap),
        None => base,
    };
    StrikeRetry {
        next_attempt_ms: now_ms + backoff_ms,
        backoff_ms,
    }
}

enum StrikeFetch {
    Price(f64),
    RateLimited,
    Failed,
}

/// Discovery seam consumed by the scheduler.
#[async_trait::async_trait]
pub trait MarketSource: Send + Sync {
    /// The currently-active market, when one qualifies and has a strike.
    async fn active_market(&self) -> Result<Option<Market>>;
}

pub struct MarketDiscovery {
    client: Client,
    asset: Asset,
    gamma_base: String,
    strike_base: String,
    strike_override: Option<f64>,
    strike_cache: Mutex<HashMap<String, f64>>,
    strike_retry: Mutex<HashMap<String, StrikeRetry>>,
}

impl MarketDiscovery {
    pub fn new(client: Client, cfg: &Config) -> Self {
        Self {
            client,
            asset: cfg.asset,
            gamma_base: GAMMA_API_BASE.to_string(),
            strike_base: STRIKE_API_BASE.to_string(),
            strike_override: cfg.strike_override,
            strike_cache: Mutex::new(HashMap::new()),
            strike_retry: Mutex::new(HashMap::new()),
        }
    }

    /// The currently-active window, or None when no candidate qualifies or
    /// its strike is still unresolved (the engine must not trade then).
    async fn discover(&self) -> Result<Option<Market>> {
        let now = Utc::now();
        let now_ts = now.timestamp();

        let ends = candidate_window_ends(now_ts);
        let probes = ends.map(|end| {
            let start = end - WINDOW_S;
            let slug = window_slug(self.asset, start);
            async move { (start, end, self.probe_slug(&slug).await) }
        });

        let mut chosen: Option<(i64, i64, GammaMarket)> = None;
        for (start, end, probed) in join_all(probes).await {
            let Some(m) = probed else { continue };
            // Trust venue-reported instants when present.
            let start_ts = parse_iso_ts(&m.event_start_time)
                .or_else(|| parse_iso_ts(&m.start_date))
                .unwrap_or(start);
            let end_ts = parse_iso_ts(&m.end_date).unwrap_or(end);
            if qualifies(&m, start_ts, end_ts, now_ts) && chosen.is_none() {
                chosen = Some((start_ts, end_ts, m));
            }
        }

        let Some((start_ts, end_ts, m)) = chosen else {
            debug!("no qualifying market window");
            return Ok(None);
        };

        let Some(strike) = self
            .resolve_strike(&m.slug, start_ts, end_ts, Utc::now().timestamp_millis())
            .await
        else {
            info!(slug = %m.slug, "awaiting strike; not trading this window yet");
            return Ok(None);
        };

        let next_slug = Some(window_slug(self.asset, end_ts));
        let market = Market::new(
            m.slug.clone(),
            m.condition_id.clone(),
            m.question.clone().unwrap_or_default(),
            m.clob_token_ids[0].clone(),
            m.clob_token_ids[1].clone(),
            strike,
            start_ts,
            end_ts,
            next_slug,
        )?;
        Ok(Some(market))
    }

    async fn probe_slug(&self, slug: &str) -> Option<GammaMarket> {
        let result = self
            .client
            .get(format!("{}/markets", self.gamma_base))
            .query(&[("slug", slug), ("limit", "1")])
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        let response = match result.and_then(|r| r.error_for_status()) {
            Ok(r) => r,
            Err(e) => {
                debug!(slug = %slug, error = %e, "market probe failed");
                return None;
            }
        };

        match response.json::<Vec<GammaMarket>>().await {
            Ok(mut markets) if !markets.is_empty() => Some(markets.remove(0)),
            Ok(_) => None,
            Err(e) => {
                debug!(slug = %slug, error = %e, "market probe parse failed");
                None
            }
        }
    }

    /// Strike for `slug`, from the override, the cache, or the authoritative
    /// starting-price endpoint (rate-limit-aware backoff; never gives up).
    async fn resolve_strike(
        &self,
        slug: &str,
        start_ts: i64,
        end_ts: i64,
        now_ms: i64,
    ) -> Option<f64> {
        if let Some(strike) = self.strike_override {
            return Some(strike);
        }
        if let Some(strike) = self.strike_cache.lock().get(slug).copied() {
            return Some(strike);
        }

        if let Some(retry) = self.strike_retry.lock().get(slug).copied() {
            if now_ms < retry.next_attempt_ms {
                return None;
            }
        }

        match self.fetch_strike(start_ts, end_ts).await {
            StrikeFetch::Price(p) => {
                info!(slug = %slug, strike = p, "strike resolved");
                self.strike_cache.lock().insert(slug.to_string(), p);
                self.strike_retry.lock().remove(slug);
                Some(p)
            }
            StrikeFetch::RateLimited => {
                let mut retries = self.strike_retry.lock();
                let prev = retries.get(slug).copied();
                let next = backoff_after_failure(prev, true, now_ms);
                warn!(slug = %slug, backoff_ms = next.backoff_ms, "strike endpoint rate-limited");
                retries.insert(slug.to_string(), next);
                None
            }
            StrikeFetch::Failed => {
                let mut retries = self.strike_retry.lock();
                let prev = retries.get(slug).copied();
                let next = backoff_after_failure(prev, false, now_ms);
                warn!(slug = %slug, backoff_ms = next.backoff_ms, "strike fetch failed");
                retries.insert(slug.to_string(), next);
                None
            }
        }
    }

    async fn fetch_strike(&self, start_ts: i64, end_ts: i64) -> StrikeFetch {
        let start_iso = DateTime::<Utc>::from_timestamp(start_ts, 0)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let end_iso = DateTime::<Utc>::from_timestamp(end_ts, 0)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();

        let result = self
            .client
            .get(format!("{}/crypto-price", self.strike_base))
            .query(&[
                ("symbol", self.asset.api_symbol()),
                ("eventStartTime", start_iso.as_str()),
                ("variant", "fifteen"),
                ("endDate", end_iso.as_str()),
            ])
            .timeout(STRIKE_TIMEOUT)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(_) => return StrikeFetch::Failed,
        };
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return StrikeFetch::RateLimited;
        }
        if !response.status().is_success() {
            return StrikeFetch::Failed;
        }

        match response.json::<StrikeResponse>().await {
            Ok(body) => match body.open_price {
                Some(p) if p.is_finite() && p > 0.0 => StrikeFetch::Price(p),
                _ => StrikeFetch::Failed,
            },
            Err(_) => StrikeFetch::Failed,
        }
    }
}

#[async_trait::async_trait]
impl MarketSource for MarketDiscovery {
    async fn active_market(&self) -> Result<Option<Market>> {
        self.discover().await
    }
}

//! Core domain types shared across the engine.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Outcome token direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    Up,
    Down,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Up => "UP",
            TokenKind::Down => "DOWN",
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            TokenKind::Up => "Up",
            TokenKind::Down => "Down",
        }
    }
}

/// Time-in-force taxonomy shared by both execution backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeInForce {
    /// Good till cancelled.
    Gtc,
    /// Good till the given unix-second expiry.
    Gtd(i64),
    /// Fill entirely or kill.
    Fok,
    /// Fill what is available immediately, kill the rest.
    Fak,
}

impl TimeInForce {
    pub fn venue_code(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Gtd(_) => "GTD",
            TimeInForce::Fok => "FOK",
            TimeInForce::Fak => "FAK",
        }
    }
}

/// Order lifecycle state. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
}

/// Exit classification for SELL trade records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitKind {
    Limit,
    StopLoss,
    HoldToMaturity,
    Breakeven,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::Limit => "LIMIT",
            ExitKind::StopLoss => "STOP_LOSS",
            ExitKind::HoldToMaturity => "HOLD_TO_MATURITY",
            ExitKind::Breakeven => "BREAKEVEN",
        }
    }
}

/// Why the session refused further entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockReason {
    ProfitTarget,
    LossLimit,
}

impl LockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockReason::ProfitTarget => "PROFIT_TARGET",
            LockReason::LossLimit => "LOSS_LIMIT",
        }
    }
}

/// Immutable descriptor of one 15-minute trading window.
#[derive(Debug, Clone)]
pub struct Market {
    pub slug: String,
    pub condition_id: String,
    pub question: String,
    pub token_up: String,
    pub token_down: String,
    /// Settlement reference price of the underlying at window start.
    pub strike: f64,
    /// Window start, unix seconds.
    pub start_ts: i64,
    /// Window end (expiry), unix seconds.
    pub end_ts: i64,
    /// Slug of the next scheduled window, when advertised.
    pub next_slug: Option<String>,
}

impl Market {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slug: String,
        condition_id: String,
        question: String,
        token_up: String,
        token_down: String,
        strike: f64,
        start_ts: i64,
        end_ts: i64,
        next_slug: Option<String>,
    ) -> Result<Self> {
        if end_ts <= start_ts {
            bail!("market {slug}: end {end_ts} not after start {start_ts}");
        }
        if token_up.is_empty() || token_down.is_empty() {
            bail!("market {slug}: missing outcome token id");
        }
        if token_up == token_down {
            bail!("market {slug}: UP and DOWN token ids are identical");
        }
        if !(strike.is_finite() && strike > 0.0) {
            bail!("market {slug}: invalid strike {strike}");
        }
        Ok(Self {
            slug,
            condition_id,
            question,
            token_up,
            token_down,
            strike,
            start_ts,
            end_ts,
            next_slug,
        })
    }

    pub fn token(&self, kind: TokenKind) -> &str {
        match kind {
            TokenKind::Up => &self.token_up,
            TokenKind::Down => &self.token_down,
        }
    }

    pub fn kind_of(&self, token_id: &str) -> Option<TokenKind> {
        if token_id == self.token_up {
            Some(TokenKind::Up)
        } else if token_id == self.token_down {
            Some(TokenKind::Down)
        } else {
            None
        }
    }

    /// Seconds until expiry (negative once past).
    pub fn time_remaining(&self, now_ts: i64) -> i64 {
        self.end_ts - now_ts
    }

    pub fn is_expiring(&self, now_ts: i64, threshold_s: i64) -> bool {
        self.time_remaining(now_ts) < threshold_s
    }
}

/// Top-of-book quote for one token at an instant. A side reported as 0 is
/// empty and must never fill anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookSnapshot {
    pub best_ask: f64,
    pub best_bid: f64,
    pub ask_size: f64,
    pub bid_size: f64,
    /// Observation instant, unix millis.
    pub observed_at_ms: i64,
}

impl BookSnapshot {
    pub fn has_ask(&self) -> bool {
        self.best_ask > 0.0
    }

    pub fn has_bid(&self) -> bool {
        self.best_bid > 0.0
    }

    pub fn is_empty(&self) -> bool {
        !self.has_ask() && !self.has_bid()
    }

    /// Ask minus bid when both sides are present.
    pub fn spread(&self) -> Option<f64> {
        (self.has_ask() && self.has_bid()).then(|| self.best_ask - self.best_bid)
    }

    pub fn mid(&self) -> Option<f64> {
        (self.has_ask() && self.has_bid()).then(|| 0.5 * (self.best_ask + self.best_bid))
    }
}

/// Ledger entry for every submitted order outcome. SELL records may point at
/// their originating BUY via `paired_with`.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: u64,
    pub order_id: String,
    pub timestamp_ms: i64,
    pub slug: String,
    pub side: OrderSide,
    pub token_id: String,
    pub token_kind: TokenKind,
    pub price: f64,
    pub size: f64,
    pub amount: f64,
    pub status: OrderStatus,
    pub paired_with: Option<u64>,
    pub exit_kind: Option<ExitKind>,
}

/// Aggregate holding per token, owned by the execution gateway.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub token_id: String,
    pub shares: f64,
    /// Volume-weighted average entry price.
    pub avg_price: f64,
    /// Latest entry fill, unix millis.
    pub entry_ts_ms: i64,
}

/// Per-market runtime aggregate owned by the strategy core.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub pnl: f64,
    pub trade_count: u64,
    pub locked: Option<LockReason>,
    pub started_at_ms: i64,
}

impl SessionState {
    pub fn new(now_ms: i64) -> Self {
        Self {
            pnl: 0.0,
            trade_count: 0,
            locked: None,
            started_at_ms: now_ms,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }
}

/// Post-crash blackout state: entries stay blocked until both the time gate
/// and the bid-stability gate are satisfied.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    pub cooling_down: bool,
    pub crash_low: f64,
    pub stability_ticks: u32,
    pub last_stop_loss_ms: Option<i64>,
    pub crash_token: Option<String>,
}

impl CircuitBreaker {
    /// Arm after a (non-breakeven) stop-loss fill.
    pub fn arm(&mut self, token_id: &str, crash_bid: f64, now_ms: i64) {
        self.cooling_down = true;
        self.crash_low = crash_bid;
        self.stability_ticks = 0;
        self.last_stop_loss_ms = Some(now_ms);
        self.crash_token = Some(token_id.to_string());
    }

    /// Record one monitor observation of the crashed token's best bid.
    /// A new low resets the stability counter.
    pub fn observe_bid(&mut self, bid: f64) {
        if !self.cooling_down {
            return;
        }
        if bid > self.crash_low {
            self.stability_ticks = self.stability_ticks.saturating_add(1);
        } else {
            self.crash_low = bid;
            self.stability_ticks = 0;
        }
    }

    pub fn time_gate_met(&self, now_ms: i64, min_cooldown_ms: i64) -> bool {
        match self.last_stop_loss_ms {
            Some(t) => now_ms - t >= min_cooldown_ms,
            None => true,
        }
    }

    pub fn stability_gate_met(&self, required_ticks: u32) -> bool {
        self.stability_ticks >= required_ticks
    }

    /// Milliseconds left on the time gate (0 when already met).
    pub fn cooldown_remaining_ms(&self, now_ms: i64, min_cooldown_ms: i64) -> i64 {
        match self.last_stop_loss_ms {
            Some(t) => (min_cooldown_ms - (now_ms - t)).max(0),
            None => 0,
        }
    }

    /// Release when both gates are satisfied; returns true when released.
    pub fn try_release(&mut self, now_ms: i64, min_cooldown_ms: i64, required_ticks: u32) -> bool {
        if !self.cooling_down {
            return false;
        }
        if self.time_gate_met(now_ms, min_cooldown_ms) && self.stability_gate_met(required_ticks) {
            self.cooling_down = false;
            self.crash_low = 0.0;
            self.stability_ticks = 0;
            self.crash_token = None;
            return true;
        }
        false
    }
}

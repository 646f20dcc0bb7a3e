//! Engine configuration.
//!
//! Everything is read from the environment (plus `.env` via dotenv); the
//! process has no required CLI flags. Malformed or inconsistent values abort
//! startup with a non-zero exit. Runtime code never re-reads the environment.

use anyhow::{bail, Context, Result};
use std::env;

/// Underlying asset for the UP/DOWN market series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "btc",
            Asset::Eth => "eth",
            Asset::Sol => "sol",
            Asset::Xrp => "xrp",
        }
    }

    /// Symbol used by the real-time spot stream (e.g. "btc/usd").
    pub fn stream_symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "btc/usd",
            Asset::Eth => "eth/usd",
            Asset::Sol => "sol/usd",
            Asset::Xrp => "xrp/usd",
        }
    }

    /// Symbol used by the starting-price endpoint (e.g. "BTC").
    pub fn api_symbol(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Sol => "SOL",
            Asset::Xrp => "XRP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Some(Asset::Btc),
            "eth" | "ethereum" => Some(Asset::Eth),
            "sol" | "solana" => Some(Asset::Sol),
            "xrp" => Some(Asset::Xrp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Paper mode (simulated cash/positions) vs live CLOB orders.
    pub paper_trade: bool,
    /// Asset whose 15-minute UP/DOWN series is traded.
    pub asset: Asset,

    // === Cadence ===
    /// Main loop period in milliseconds.
    pub tick_interval_ms: u64,
    /// Stop-loss monitor period in milliseconds.
    pub stop_loss_check_interval_ms: u64,
    /// Seconds before expiry at which the engine rotates to the next market.
    pub market_rotation_threshold_s: i64,

    // === Sizing ===
    /// Initial paper cash.
    pub bankroll: f64,
    /// Entry size as a share of current cash.
    pub trade_size_pct: f64,
    /// Minimum entry value in dollars.
    pub min_order_size: f64,

    // === Entry band & spread ===
    pub min_entry_price: f64,
    pub max_entry_price: f64,
    pub max_allowed_spread: f64,

    // === Exit management ===
    /// Resting SELL offset above entry.
    pub fixed_profit_target: f64,
    /// Entry minus stop price.
    pub fixed_stop_loss: f64,
    /// Profit at which the stop moves to entry.
    pub breakeven_trigger: f64,

    // === Session lock ===
    pub session_profit_target: f64,
    pub session_loss_limit: f64,

    // === Circuit breaker & rate limit ===
    pub stability_ticks_required: u32,
    pub min_cooldown_ms: i64,
    pub min_trade_interval_ms: i64,

    // === Reporting ===
    pub report_dir: String,
    /// Operator-supplied strike when the starting-price endpoint is down.
    pub strike_override: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paper_trade: true,
            asset: Asset::Btc,
            tick_interval_ms: 500,
            stop_loss_check_interval_ms: 150,
            market_rotation_threshold_s: 30,
            bankroll: 20.00,
            trade_size_pct: 0.10,
            min_order_size: 1.00,
            min_entry_price: 0.65,
            max_entry_price: 0.85,
            max_allowed_spread: 0.03,
            fixed_profit_target: 0.02,
            fixed_stop_loss: 0.04,
            breakeven_trigger: 0.015,
            session_profit_target: 0.50,
            session_loss_limit: 0.40,
            stability_ticks_required: 15,
            min_cooldown_ms: 15_000,
            min_trade_interval_ms: 5_000,
            report_dir: "reports".to_string(),
            strike_override: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => bail!("invalid {key}={raw:?}: expected a boolean"),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let asset = match env::var("ASSET") {
            Ok(raw) => Asset::parse(&raw)
                .with_context(|| format!("invalid ASSET={raw:?} (btc|eth|sol|xrp)"))?,
            Err(_) => defaults.asset,
        };

        let strike_override = match env::var("STRIKE_OVERRIDE") {
            Ok(raw) => Some(
                raw.trim()
                    .parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("invalid STRIKE_OVERRIDE={raw:?}: {e}"))?,
            ),
            Err(_) => None,
        };

        let cfg = Self {
            paper_trade: env_bool("PAPER_TRADE", defaults.paper_trade)?,
            asset,
            tick_interval_ms: env_parse("TICK_INTERVAL", defaults.tick_interval_ms)?,
            stop_loss_check_interval_ms: env_parse(
                "STOP_LOSS_CHECK_INTERVAL",
                defaults.stop_loss_check_interval_ms,
            )?,
            market_rotation_threshold_s: env_parse(
                "MARKET_ROTATION_THRESHOLD",
                defaults.market_rotation_threshold_s,
            )?,
            bankroll: env_parse("BANKROLL", defaults.bankroll)?,
            trade_size_pct: env_parse("TRADE_SIZE_PCT", defaults.trade_size_pct)?,
            min_order_size: env_parse("MIN_ORDER_SIZE", defaults.min_order_size)?,
            min_entry_price: env_parse("MIN_ENTRY_PRICE", defaults.min_entry_price)?,
            max_entry_price: env_parse("MAX_ENTRY_PRICE", defaults.max_entry_price)?,
            max_allowed_spread: env_parse("MAX_ALLOWED_SPREAD", defaults.max_allowed_spread)?,
            fixed_profit_target: env_parse("FIXED_PROFIT_TARGET", defaults.fixed_profit_target)?,
            fixed_stop_loss: env_parse("FIXED_STOP_LOSS", defaults.fixed_stop_loss)?,
            breakeven_trigger: env_parse("BREAKEVEN_TRIGGER", defaults.breakeven_trigger)?,
            session_profit_target: env_parse(
                "SESSION_PROFIT_TARGET",
                defaults.session_profit_target,
            )?,
            session_loss_limit: env_parse("SESSION_LOSS_LIMIT", defaults.session_loss_limit)?,
            stability_ticks_required: env_parse(
                "STABILITY_TICKS_REQUIRED",
                defaults.stability_ticks_required,
            )?,
            min_cooldown_ms: env_parse("MIN_COOLDOWN_MS", defaults.min_cooldown_ms)?,
            min_trade_interval_ms: env_parse(
                "MIN_TRADE_INTERVAL_MS",
                defaults.min_trade_interval_ms,
            )?,
            report_dir: env::var("REPORT_DIR").unwrap_or(defaults.report_dir),
            strike_override,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            bail!("TICK_INTERVAL must be positive");
        }
        if self.stop_loss_check_interval_ms == 0 {
            bail!("STOP_LOSS_CHECK_INTERVAL must be positive");
        }
        if self.market_rotation_threshold_s < 0 {
            bail!("MARKET_ROTATION_THRESHOLD must be non-negative");
        }
        if !(self.bankroll.is_finite() && self.bankroll > 0.0) {
            bail!("BANKROLL must be positive");
        }
        if !(self.trade_size_pct > 0.0 && self.trade_size_pct <= 1.0) {
            bail!("TRADE_SIZE_PCT must be in (0, 1]");
        }
        if !(self.min_order_size > 0.0) {
            bail!("MIN_ORDER_SIZE must be positive");
        }
        if !(self.min_entry_price > 0.0 && self.min_entry_price < 1.0) {
            bail!("MIN_ENTRY_PRICE must be in (0, 1)");
        }
        if !(self.max_entry_price > 0.0 && self.max_entry_price < 1.0) {
            bail!("MAX_ENTRY_PRICE must be in (0, 1)");
        }
        if self.min_entry_price >= self.max_entry_price {
            bail!("MIN_ENTRY_PRICE must be below MAX_ENTRY_PRICE");
        }
        if !(self.max_allowed_spread > 0.0) {
            bail!("MAX_ALLOWED_SPREAD must be positive");
        }
        if !(self.fixed_profit_target > 0.0) {
            bail!("FIXED_PROFIT_TARGET must be positive");
        }
        if !(self.fixed_stop_loss > 0.0) {
            bail!("FIXED_STOP_LOSS must be positive");
        }
        if !(self.breakeven_trigger > 0.0) {
            bail!("BREAKEVEN_TRIGGER must be positive");
        }
        if !(self.session_profit_target > 0.0) {
            bail!("SESSION_PROFIT_TARGET must be positive");
        }
        if !(self.session_loss_limit > 0.0) {
            bail!("SESSION_LOSS_LIMIT must be positive");
        }
        if self.min_cooldown_ms < 0 || self.min_trade_interval_ms < 0 {
            bail!("cooldown/trade-interval must be non-negative");
        }
        if let Some(strike) = self.strike_override {
            if !(strike.is_finite() && strike > 0.0) {
                bail!("STRIKE_OVERRIDE must be positive");
            }
        }
        Ok(())
    }
}

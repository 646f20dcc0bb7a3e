//! Execution gateway: one contract, two backends (paper here, live CLOB in
//! `clob_live`). The paper backend owns the simulated cash and position map
//! and fills resting orders against observed top-of-book prices.

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{BookSnapshot, OrderSide, Position, TimeInForce};

/// Shares below this are treated as a closed position.
pub const POSITION_EPSILON: f64 = 1e-9;

/// A resting order tracked by the gateway.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub tif: TimeInForce,
    pub created_at_ms: i64,
}

/// A completed fill, queryable by order id.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub filled_at_ms: i64,
}

/// Order placement, cancellation and position accounting, uniform across
/// paper and live mode. Mode selection is process-wide at startup.
#[async_trait::async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Place a resting limit order; returns the gateway-assigned order id.
    async fn place_limit(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        tif: TimeInForce,
    ) -> Result<String>;

    /// Fill-or-kill market order. `amount` is monetary for BUY, shares for
    /// SELL; executes entirely against `price` or fails with no state change.
    async fn place_fok(
        &self,
        token_id: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<String>;

    /// Cancel a resting order; false when it was not open.
    async fn cancel(&self, order_id: &str) -> Result<bool>;

    /// Immediate best-effort (fill-and-kill) order; true when anything filled.
    async fn execute_fak(&self, token_id: &str, side: OrderSide, price: f64, size: f64)
        -> Result<bool>;

    async fn is_filled(&self, order_id: &str) -> Result<bool>;

    async fn fill_info(&self, order_id: &str) -> Result<Option<Fill>>;

    async fn position(&self, token_id: &str) -> Option<Position>;

    async fn all_positions(&self) -> Vec<Position>;

    async fn cash(&self) -> f64;

    async fn open_orders(&self) -> Vec<OpenOrder>;

    /// Cancel every open order (live) or wipe local order/position state
    /// (paper); invoked at market rotation.
    async fn clear_all(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct PaperState {
    cash: f64,
    positions: HashMap<String, Position>,
    open_orders: HashMap<String, OpenOrder>,
    fills: HashMap<String, Fill>,
}

/// Simulated gateway: fills resting orders at the touch when the observed
/// book crosses them, and FOK/FAK orders against caller-supplied prices.
#[derive(Debug)]
pub struct PaperGateway {
    state: Mutex<PaperState>,
    min_order_size: f64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_order_id() -> String {
    format!("paper:{}", Uuid::new_v4())
}

impl PaperGateway {
    pub fn new(initial_cash: f64, min_order_size: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                cash: initial_cash,
                ..Default::default()
            }),
            min_order_size,
        }
    }

    /// Run one fill-check pass for `token_id` against a same-tick book
    /// snapshot. Returns the fills produced by this pass.
    ///
    /// BUYs fill at `min(best_ask, limit)` only when the ask side is
    /// non-empty and at or below the limit; SELLs at `max(best_bid, limit)`
    /// only when the bid side is non-empty and at or above the limit. An
    /// empty side (reported as 0) never fills. Orders already in the filled
    /// index but still present in the open set are purged without emitting a
    /// second fill.
    pub fn check_fills(&self, token_id: &str, book: &BookSnapshot) -> Vec<Fill> {
        let mut state = self.state.lock();
        let mut produced = Vec::new();

        let candidate_ids: Vec<String> = state
            .open_orders
            .values()
            .filter(|o| o.token_id == token_id)
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in candidate_ids {
            if state.fills.contains_key(&order_id) {
                state.open_orders.remove(&order_id);
                continue;
            }

            let order = match state.open_orders.get(&order_id) {
                Some(o) => o.clone(),
                None => continue,
            };

            let fill_price = match order.side {
                OrderSide::Buy if book.has_ask() && book.best_ask <= order.price => {
                    Some(book.best_ask.min(order.price))
                }
                OrderSide::Sell if book.has_bid() && book.best_bid >= order.price => {
                    Some(book.best_bid.max(order.price))
                }
                _ => None,
            };

            let Some(price) = fill_price else {
                continue;
            };

            match order.side {
                OrderSide::Buy => {
                    Self::apply_buy(&mut state, &order.token_id, price, order.size)
                }
                OrderSide::Sell => {
                    Self::apply_sell(&mut state, &order.token_id, price, order.size)
                }
            }

            let fill = Fill {
                order_id: order.order_id.clone(),
                token_id: order.token_id.clone(),
                side: order.side,
                price,
                size: order.size,
                filled_at_ms: book.observed_at_ms,
            };
            state.open_orders.remove(&order_id);
            state.fills.insert(order_id, fill.clone());
            produced.push(fill);
        }

        produced
    }

    fn apply_buy(state: &mut PaperState, token_id: &str, price: f64, size: f64) {
        state.cash -= price * size;
        let ts = now_ms();
        let pos = state
            .positions
            .entry(token_id.to_string())
            .or_insert_with(|| Position {
                token_id: token_id.to_string(),
                shares: 0.0,
                avg_price: price,
                entry_ts_ms: ts,
            });
        let new_shares = pos.shares + size;
        pos.avg_price = (pos.avg_price * pos.shares + price * size) / new_shares;
        pos.shares = new_shares;
        pos.entry_ts_ms = ts;
    }

    fn apply_sell(state: &mut PaperState, token_id: &str, price: f64, size: f64) {
        state.cash += price * size;
        if let Some(pos) = state.positions.get_mut(token_id) {
            pos.shares = (pos.shares - size).max(0.0);
            if pos.shares <= POSITION_EPSILON {
                state.positions.remove(token_id);
            }
        }
    }
}

#[async_trait::async_trait]
impl ExecutionGateway for PaperGateway {
    async fn place_limit(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
        tif: TimeInForce,
    ) -> Result<String> {
        if !(price.is_finite() && price > 0.0 && price < 1.0) {
            bail!("invalid limit price {price}");
        }
        if !(size.is_finite() && size > 0.0) {
            bail!("invalid size {size}");
        }

        let order_id = new_order_id();
        let order = OpenOrder {
            order_id: order_id.clone(),
            token_id: token_id.to_string(),
            side,
            price,
            size,
            tif,
            created_at_ms: now_ms(),
        };
        self.state.lock().open_orders.insert(order_id.clone(), order);
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

        let mut state = self.state.lock();
        let size = match side {
            OrderSide::Buy => {
                if amount < self.min_order_size {
                    bail!("FOK amount {amount:.4} below minimum order size");
                }
                if state.cash + POSITION_EPSILON < amount {
                    bail!("insufficient cash: have {:.4}, need {amount:.4}", state.cash);
                }
                amount / price
            }
            OrderSide::Sell => {
                let held = state
                    .positions
                    .get(token_id)
                    .map(|p| p.shares)
                    .unwrap_or(0.0);
                if held + POSITION_EPSILON < amount {
                    bail!("insufficient position: have {held:.4}, need {amount:.4}");
                }
                amount
            }
        };

        match side {
            OrderSide::Buy => Self::apply_buy(&mut state, token_id, price, size),
            OrderSide::Sell => Self::apply_sell(&mut state, token_id, price, size),
        }

        // FOK orders never enter the open set; they land directly in the
        // filled index so later fill-check passes cannot double-count them.
        let order_id = new_order_id();
        state.fills.insert(
            order_id.clone(),
            Fill {
                order_id: order_id.clone(),
                token_id: token_id.to_string(),
                side,
                price,
                size,
                filled_at_ms: now_ms(),
            },
        );
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &str) -> Result<bool> {
        Ok(self.state.lock().open_orders.remove(order_id).is_some())
    }

    async fn execute_fak(
        &self,
        token_id: &str,
        side: OrderSide,
        price: f64,
        size: f64,
    ) -> Result<bool> {
        if !(price.is_finite() && price > 0.0) {
            return Err(anyhow!("invalid price {price}"));
        }
        if !(size.is_finite() && size > 0.0) {
            return Err(anyhow!("invalid size {size}"));
        }

        let mut state = self.state.lock();
        let fill_size = match side {
            OrderSide::Sell => {
                let held = state
                    .positions
                    .get(token_id)
                    .map(|p| p.shares)
                    .unwrap_or(0.0);
                size.min(held)
            }
            OrderSide::Buy => {
                let affordable = (state.cash / price).max(0.0);
                size.min(affordable)
            }
        };

        if fill_size <= POSITION_EPSILON {
            return Ok(false);
        }

        match side {
            OrderSide::Buy => Self::apply_buy(&mut state, token_id, price, fill_size),
            OrderSide::Sell => Self::apply_sell(&mut state, token_id, price, fill_size),
        }

        let order_id = new_order_id();
        state.fills.insert(
            order_id.clone(),
            Fill {
                order_id: order_id.clone(),
                token_id: token_id.to_string(),
                side,
                price,
                size: fill_size,
                filled_at_ms: now_ms(),
            },
        );
        Ok(true)
    }

    async fn is_filled(&self, order_id: &str) -> Result<bool> {
        Ok(self.state.lock().fills.contains_key(order_id))
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

    async fn clear_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open_orders.clear();
        state.fills.clear();
        state.positions.clear();
        // Cash is the wallet and spans sessions; the reporter records the
        // per-session starting/ending balances.
        Ok(())
    }
}

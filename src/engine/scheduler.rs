//! Tick scheduler: the 500 ms main loop, the 150 ms stop-loss monitor, and
//! the market-rotation protocol between consecutive windows.

use anyhow::Result;
use chrono::Utc;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    engine::{
        gateway::{ExecutionGateway, PaperGateway},
        quant::{fair_value, PriceHistory},
        report::SessionReporter,
        strategy::{EntryDecision, SkipReason, StrategyCore},
    },
    models::{Market, TokenKind},
    scrapers::{clob_book::BookSource, gamma::MarketSource, spot_feed::SpotSource},
};

/// Status line cadence, in main ticks.
const STATUS_EVERY_TICKS: u64 = 20;

/// Everything the scheduler drives. Built once in `main`.
pub struct EngineHandles {
    pub cfg: Config,
    pub spot: Arc<dyn SpotSource>,
    pub discovery: Arc<dyn MarketSource>,
    pub books: Arc<dyn BookSource>,
    pub gateway: Arc<dyn ExecutionGateway>,
    /// Present in paper mode; same instance as `gateway`.
    pub paper: Option<Arc<PaperGateway>>,
    pub strategy: Arc<AsyncMutex<StrategyCore>>,
    pub reporter: Arc<AsyncMutex<SessionReporter>>,
    pub shutdown: Arc<AtomicBool>,
}

/// Rotation fires on a slug change or inside the expiry threshold.
fn rotation_due(
    current: Option<&Market>,
    discovered: Option<&Market>,
    now_ts: i64,
    threshold_s: i64,
) -> bool {
    let Some(cur) = current else {
        return false;
    };
    if let Some(new) = discovered {
        if new.slug != cur.slug {
            return true;
        }
    }
    cur.is_expiring(now_ts, threshold_s)
}

pub struct TickScheduler {
    h: EngineHandles,
    current: Option<Market>,
    /// Spot-price ring feeding the volatility and fair-value model.
    spot_history: PriceHistory,
    ticks: u64,
}

impl TickScheduler {
    pub fn new(handles: EngineHandles) -> Self {
        Self {
            h: handles,
            current: None,
            spot_history: PriceHistory::new(),
            ticks: 0,
        }
    }

    /// Main loop. Each iteration is guarded: recoverable errors are logged
    /// and the next tick proceeds. Returns after shutdown, with the final
    /// session report written.
    pub async fn run(mut self) {
        let mut ticker = interval(Duration::from_millis(self.h.cfg.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_ms = self.h.cfg.tick_interval_ms,
            monitor_ms = self.h.cfg.stop_loss_check_interval_ms,
            mode = if self.h.cfg.paper_trade { "paper" } else { "live" },
            asset = self.h.cfg.asset.as_str(),
            "scheduler started"
        );

        while !self.h.shutdown.load(Ordering::Acquire) {
            ticker.tick().await;
            if self.h.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "tick aborted");
            }
        }

        if let Err(e) = self.finalize_on_shutdown().await {
            warn!(error = %e, "final report failed");
        }
        info!("scheduler stopped");
    }

    /// One main-loop iteration.
    pub async fn tick(&mut self) -> Result<()> {
        let now = Utc::now();
        let now_ts = now.timestamp();
        let now_ms = now.timestamp_millis();

        // (1) Active market and rotation.
        let discovered = match self.h.discovery.active_market().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "market discovery failed");
                None
            }
        };

        if rotation_due(
            self.current.as_ref(),
            discovered.as_ref(),
            now_ts,
            self.h.cfg.market_rotation_threshold_s,
        ) {
            self.rotate(discovered, now_ts, now_ms).await?;
        } else if self.current.is_none() {
            if let Some(market) = discovered {
                self.adopt(market, now_ms).await;
            }
        }

        let Some(market) = self.current.clone() else {
            return Ok(());
        };

        // (2) Spot. Absence means skip, never trade on stale data.
        let Ok(spot) = self.h.spot.latest() else {
            debug!("skip tick: spot feed not ready");
            return Ok(());
        };
        self.spot_history.push(spot.price, now_ms);

        // (3) Books for both tokens.
        let up_book = match self.h.books.book(&market.token_up).await {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "skip tick: UP book unavailable");
                return Ok(());
            }
        };
        let down_book = match self.h.books.book(&market.token_down).await {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "skip tick: DOWN book unavailable");
                return Ok(());
            }
        };

        // (4) Paper fills against this tick's books, before order-status
        // maintenance and before any new entry, so cash freed by a SELL is
        // available to an entry in the same tick.
        if let Some(paper) = &self.h.paper {
            for (token, book) in [
                (market.token_up.as_str(), &up_book),
                (market.token_down.as_str(), &down_book),
            ] {
                for fill in paper.check_fills(token, book) {
                    debug!(
                        order_id = %fill.order_id,
                        side = fill.side.as_str(),
                        price = fill.price,
                        "paper fill"
                    );
                }
            }
        }

        let remaining_s = market.time_remaining(now_ts);

        let mut strategy = self.h.strategy.lock().await;

        // (5) Ledger maintenance: paired fills, hold-to-maturity.
        strategy.record_bids(&up_book, &down_book, now_ms);
        strategy
            .update_order_status(remaining_s, &up_book, &down_book, self.h.gateway.as_ref(), now_ms)
            .await?;

        // (6) Safe-zone filter.
        if !strategy.in_safe_zone(&up_book, &down_book) {
            strategy.skips.kill_zone += 1;
            debug!("skip tick: both tokens outside the entry band");
        } else {
            // (7) Entry decision.
            let cash = self.h.gateway.cash().await;
            match strategy.should_enter(
                spot.price,
                market.strike,
                remaining_s,
                &up_book,
                &down_book,
                cash,
                now_ms,
            ) {
                EntryDecision::Enter { direction } => {
                    strategy
                        .execute_entry(
                            &market,
                            direction,
                            self.h.gateway.as_ref(),
                            self.h.books.as_ref(),
                            now_ms,
                        )
                        .await?;
                }
                EntryDecision::Skip(reason) => log_skip(&reason),
            }
        }
        drop(strategy);

        // (8) Periodic status.
        self.ticks += 1;
        if self.ticks % STATUS_EVERY_TICKS == 0 {
            self.log_status(&market, spot.price, remaining_s, &up_book, &down_book)
                .await;
        }
        Ok(())
    }

    async fn adopt(&mut self, market: Market, now_ms: i64) {
        let cash = self.h.gateway.cash().await;
        self.h
            .reporter
            .lock()
            .await
            .begin_session(&market.slug, cash, now_ms);
        info!(
            slug = %market.slug,
            strike = market.strike,
            start_ts = market.start_ts,
            end_ts = market.end_ts,
            "market adopted"
        );
        self.current = Some(market);
    }

    /// Rotation protocol: emergency exit, report, clear, reset, re-adopt.
    async fn rotate(&mut self, next: Option<Market>, now_ts: i64, now_ms: i64) -> Result<()> {
        let mut old_slug = None;
        if let Some(cur) = self.current.take() {
            info!(slug = %cur.slug, "MARKET ROTATION: closing session");

            let mut strategy = self.h.strategy.lock().await;
            strategy
                .emergency_exit_all(self.h.gateway.as_ref(), self.h.books.as_ref(), now_ms)
                .await?;

            let stats = strategy.stats(&|_| None);
            let ending_cash = self.h.gateway.cash().await;
            self.h
                .reporter
                .lock()
                .await
                .finalize(&strategy, &stats, ending_cash, now_ms)?;

            self.h.gateway.clear_all().await?;
            strategy.reset(now_ms);
            self.spot_history.clear();
            old_slug = Some(cur.slug);
        }

        // Only adopt a successor that is a genuinely fresh window; the one
        // just closed (or one itself about to expire) waits for discovery.
        let fresh = next.filter(|m| {
            Some(&m.slug) != old_slug.as_ref()
                && !m.is_expiring(now_ts, self.h.cfg.market_rotation_threshold_s)
        });
        if let Some(market) = fresh {
            self.adopt(market, now_ms).await;
        }
        Ok(())
    }

    async fn finalize_on_shutdown(&mut self) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let strategy = self.h.strategy.lock().await;
        let stats = strategy.stats(&|_| None);
        let ending_cash = self.h.gateway.cash().await;

        // Open positions are left alone on shutdown; winding them down is an
        // operator decision.
        let open = strategy.active_positions().count();
        if open > 0 {
            warn!(open_positions = open, "shutting down with open positions");
        }

        self.h
            .reporter
            .lock()
            .await
            .finalize(&strategy, &stats, ending_cash, now_ms)?;
        info!(
            cash = format!("{ending_cash:.4}"),
            realized = format!("{:+.4}", stats.realized_pnl),
            "wallet summary at shutdown"
        );
        Ok(())
    }

    async fn log_status(
        &self,
        market: &Market,
        spot: f64,
        remaining_s: i64,
        up_book: &crate::models::BookSnapshot,
        down_book: &crate::models::BookSnapshot,
    ) {
        let vol = self.spot_history.volatility_per_minute();
        let fv_up = fair_value(TokenKind::Up, spot, market.strike, remaining_s as f64, vol);
        let fv_down = fair_value(TokenKind::Down, spot, market.strike, remaining_s as f64, vol);

        let strategy = self.h.strategy.lock().await;
        let session = strategy.session();
        info!(
            slug = %market.slug,
            spot = format!("{spot:.2}"),
            strike = format!("{:.2}", market.strike),
            remaining_s,
            vol = format!("{vol:.2}"),
            fv_up = format!("{fv_up:.4}"),
            fv_down = format!("{fv_down:.4}"),
            up_bid = up_book.best_bid,
            up_ask = up_book.best_ask,
            down_bid = down_book.best_bid,
            down_ask = down_book.best_ask,
            session_pnl = format!("{:+.4}", session.pnl),
            open_positions = strategy.active_positions().count(),
            locked = session.is_locked(),
            cooling = strategy.breaker().cooling_down,
            "tick status"
        );
    }
}

fn log_skip(reason: &SkipReason) {
    match reason {
        SkipReason::SessionLocked(lock) => {
            debug!(reason = lock.as_str(), "SESSION LOCKED: entry rejected")
        }
        SkipReason::PriceBand { ask } => debug!(ask, "REJECTED: floor/ceiling"),
        SkipReason::Cooldown { remaining_ms } => debug!(remaining_ms, "COOLDOWN: entry rejected"),
        SkipReason::RateLimited { since_last_ms } => {
            debug!(since_last_ms, "RATE LIMIT: entry rejected")
        }
        SkipReason::PendingTrade => debug!("entry rejected: pending trade"),
        SkipReason::InsufficientCash { cash } => debug!(cash, "entry rejected: cash below minimum"),
        SkipReason::TimeGate { remaining_s } => debug!(remaining_s, "entry rejected: time gate"),
    }
}

/// Spawn the high-frequency stop-loss monitor. A boolean flag serializes the
/// pass against itself; state mutation is serialized by the strategy mutex.
pub fn spawn_monitor(
    interval_ms: u64,
    strategy: Arc<AsyncMutex<StrategyCore>>,
    gateway: Arc<dyn ExecutionGateway>,
    books: Arc<dyn BookSource>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let busy = AtomicBool::new(false);
        let mut ticker = interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !shutdown.load(Ordering::Acquire) {
            ticker.tick().await;
            if busy.swap(true, Ordering::AcqRel) {
                continue;
            }

            let now_ms = Utc::now().timestamp_millis();
            {
                let mut s = strategy.lock().await;
                if s.has_open_position() || s.breaker().cooling_down {
                    if let Err(e) = s
                        .run_monitor_pass(gateway.as_ref(), books.as_ref(), now_ms)
                        .await
                    {
                        warn!(error = %e, "stop-loss monitor pass failed");
                    }
                }
            }
            busy.store(false, Ordering::Release);
        }
        debug!("stop-loss monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(slug: &str, start: i64, end: i64) -> Market {
        Market::new(
            slug.into(),
            "0xc".into(),
            "q".into(),
            "up".into(),
            "down".into(),
            100.0,
            start,
            end,
            None,
        )
        .unwrap()
    }

    #[test]
    fn rotation_on_slug_change() {
        let cur = market("a", 0, 900);
        let new = market("b", 900, 1800);
        assert!(rotation_due(Some(&cur), Some(&new), 500, 30));
    }

    #[test]
    fn rotation_on_expiry_threshold() {
        let cur = market("a", 0, 900);
        assert!(!rotation_due(Some(&cur), Some(&cur), 500, 30));
        assert!(rotation_due(Some(&cur), Some(&cur), 871, 30));
        // Discovery outage near expiry still rotates.
        assert!(rotation_due(Some(&cur), None, 880, 30));
    }

    #[test]
    fn no_rotation_without_current() {
        let new = market("b", 900, 1800);
        assert!(!rotation_due(None, Some(&new), 1000, 30));
        assert!(!rotation_due(None, None, 1000, 30));
    }
}

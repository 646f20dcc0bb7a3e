//! Session reporting: per-window aggregation and a human-readable JSON
//! report written at rotation and on shutdown.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::{fs, path::PathBuf};
use tracing::info;

use crate::engine::strategy::{StrategyCore, StrategyStats};
use crate::models::{OrderSide, OrderStatus, TradeRecord};

#[derive(Debug, Clone, Serialize)]
pub struct TradeJson {
    pub id: u64,
    pub timestamp: String,
    pub slug: String,
    pub side: &'static str,
    pub token_type: &'static str,
    pub price: f64,
    pub size: f64,
    pub amount: f64,
    pub order_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_with: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_type: Option<&'static str>,
}

impl TradeJson {
    fn from_record(t: &TradeRecord) -> Self {
        Self {
            id: t.id,
            timestamp: iso(t.timestamp_ms),
            slug: t.slug.clone(),
            side: t.side.as_str(),
            token_type: t.token_kind.as_str(),
            price: t.price,
            size: t.size,
            amount: t.amount,
            order_id: t.order_id.clone(),
            status: match t.status {
                OrderStatus::Pending => "PENDING",
                OrderStatus::Filled => "FILLED",
                OrderStatus::Cancelled => "CANCELLED",
            },
            paired_with: t.paired_with,
            exit_type: t.exit_kind.map(|k| k.as_str()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionSection {
    start: String,
    end: String,
    duration_s: i64,
    slug: String,
}

#[derive(Debug, Serialize)]
struct WalletSection {
    starting: f64,
    ending: f64,
    net_change: f64,
    net_change_pct: f64,
    profitable: bool,
}

#[derive(Debug, Serialize)]
struct ExitsSection {
    limit_sells: u64,
    stop_losses: u64,
    breakeven: u64,
    cancelled: u64,
    total: u64,
}

#[derive(Debug, Serialize)]
struct StatsSection {
    total_buys: u64,
    executed_buys: u64,
    exits: ExitsSection,
    naked_positions: u64,
    total_trades: u64,
}

#[derive(Debug, Serialize)]
struct FinancialSection {
    invested: f64,
    proceeds: f64,
    realized: f64,
    unrealized: f64,
    net: f64,
    roi: f64,
}

#[derive(Debug, Serialize)]
struct CompletedPair {
    buy: TradeJson,
    sell: TradeJson,
    pnl: f64,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    session: SessionSection,
    wallet: WalletSection,
    statistics: StatsSection,
    financial: FinancialSection,
    trades: Vec<TradeJson>,
    completed_trades: Vec<CompletedPair>,
    naked_positions: Vec<TradeJson>,
}

fn iso(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
struct ActiveSession {
    slug: String,
    started_at_ms: i64,
    starting_cash: f64,
}

/// Aggregates a session's ledger into the persisted report.
#[derive(Debug)]
pub struct SessionReporter {
    dir: PathBuf,
    session: Option<ActiveSession>,
}

impl SessionReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session: None,
        }
    }

    pub fn begin_session(&mut self, slug: &str, starting_cash: f64, now_ms: i64) {
        info!(slug = %slug, starting_cash, "session started");
        self.session = Some(ActiveSession {
            slug: slug.to_string(),
            started_at_ms: now_ms,
            starting_cash,
        });
    }

    pub fn active_slug(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.slug.as_str())
    }

    /// Build the report for the active session from the strategy ledger.
    pub fn build(
        &self,
        strategy: &StrategyCore,
        stats: &StrategyStats,
        ending_cash: f64,
        now_ms: i64,
    ) -> Option<SessionReport> {
        let session = self.session.as_ref()?;
        let trades: Vec<&TradeRecord> = strategy.trades().collect();

        let invested: f64 = trades
            .iter()
            .filter(|t| t.side == OrderSide::Buy && t.status == OrderStatus::Filled)
            .map(|t| t.amount)
            .sum();
        let proceeds: f64 = trades
            .iter()
            .filter(|t| t.side == OrderSide::Sell && t.status == OrderStatus::Filled)
            .map(|t| t.amount)
            .sum();

        let completed: Vec<CompletedPair> = trades
            .iter()
            .filter(|t| t.side == OrderSide::Sell && t.status == OrderStatus::Filled)
            .filter_map(|sell| {
                let buy_id = sell.paired_with?;
                let buy = trades.iter().find(|t| t.id == buy_id)?;
                Some(CompletedPair {
                    buy: TradeJson::from_record(buy),
                    sell: TradeJson::from_record(sell),
                    pnl: (sell.price - buy.price) * sell.size,
                })
            })
            .collect();

        let naked: Vec<TradeJson> = trades
            .iter()
            .filter(|t| t.side == OrderSide::Buy && t.status == OrderStatus::Filled)
            .filter(|buy| {
                !trades.iter().any(|s| {
                    s.side == OrderSide::Sell
                        && s.status == OrderStatus::Filled
                        && s.paired_with == Some(buy.id)
                })
            })
            .map(|t| TradeJson::from_record(t))
            .collect();

        let net_change = ending_cash - session.starting_cash;
        let net_change_pct = if session.starting_cash > 0.0 {
            net_change / session.starting_cash * 100.0
        } else {
            0.0
        };
        let exits_total =
            stats.limit_sells + stats.stop_losses + stats.breakeven_exits + stats.cancelled_sells;
        let roi = if invested > 0.0 {
            stats.net_pnl / invested
        } else {
            0.0
        };

        Some(SessionReport {
            session: SessionSection {
                start: iso(session.started_at_ms),
                end: iso(now_ms),
                duration_s: (now_ms - session.started_at_ms) / 1000,
                slug: session.slug.clone(),
            },
            wallet: WalletSection {
                starting: session.starting_cash,
                ending: ending_cash,
                net_change,
                net_change_pct,
                profitable: net_change > 0.0,
            },
            statistics: StatsSection {
                total_buys: stats.total_buys,
                executed_buys: stats.executed_buys,
                exits: ExitsSection {
                    limit_sells: stats.limit_sells,
                    stop_losses: stats.stop_losses,
                    breakeven: stats.breakeven_exits,
                    cancelled: stats.cancelled_sells,
                    total: exits_total,
                },
                naked_positions: stats.naked_positions,
                total_trades: trades.len() as u64,
            },
            financial: FinancialSection {
                invested,
                proceeds,
                realized: stats.realized_pnl,
                unrealized: stats.unrealized_pnl,
                net: stats.net_pnl,
                roi,
            },
            trades: trades.iter().map(|t| TradeJson::from_record(t)).collect(),
            completed_trades: completed,
            naked_positions: naked,
        })
    }

    /// Write the report and close the session. Returns the file path, or
    /// None when no session was active.
    pub fn finalize(
        &mut self,
        strategy: &StrategyCore,
        stats: &StrategyStats,
        ending_cash: f64,
        now_ms: i64,
    ) -> Result<Option<PathBuf>> {
        let Some(report) = self.build(strategy, stats, ending_cash, now_ms) else {
            return Ok(None);
        };
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create report dir {}", self.dir.display()))?;
        let path = self
            .dir
            .join(format!("session_{}_{}.json", session.slug, now_ms / 1000));
        let json = serde_json::to_string_pretty(&report).context("serialize session report")?;
        fs::write(&path, json).with_context(|| format!("write report {}", path.display()))?;

        info!(
            slug = %session.slug,
            starting = report.wallet.starting,
            ending = report.wallet.ending,
            net = format!("{:+.4}", report.wallet.net_change),
            trades = report.statistics.total_trades,
            path = %path.display(),
            "session report written"
        );
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::gateway::{ExecutionGateway, PaperGateway};
    use crate::models::{BookSnapshot, Market, TokenKind};
    use crate::scrapers::clob_book::BookSource;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct StubBooks {
        books: Mutex<HashMap<String, BookSnapshot>>,
    }

    #[async_trait::async_trait]
    impl BookSource for StubBooks {
        async fn book(&self, token_id: &str) -> anyhow::Result<BookSnapshot> {
            self.books
                .lock()
                .get(token_id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no book"))
        }
    }

    fn market() -> Market {
        Market::new(
            "btc-updown-15m-1000".into(),
            "0xcond".into(),
            "q".into(),
            "tok-up".into(),
            "tok-down".into(),
            89_750.0,
            1000,
            1900,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn report_shape_and_wallet_math() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reporter = SessionReporter::new(tmp.path());
        let mut strategy = StrategyCore::new(Config::default(), 0);
        let gw = PaperGateway::new(20.0, 1.0);
        let books = StubBooks {
            books: Mutex::new(HashMap::new()),
        };
        books.books.lock().insert(
            "tok-up".into(),
            BookSnapshot {
                best_ask: 0.68,
                best_bid: 0.66,
                ask_size: 10.0,
                bid_size: 10.0,
                observed_at_ms: 1,
            },
        );

        reporter.begin_session("btc-updown-15m-1000", 20.0, 0);
        assert_eq!(reporter.active_slug(), Some("btc-updown-15m-1000"));

        strategy
            .execute_entry(&market(), TokenKind::Up, &gw, &books, 10_000)
            .await
            .unwrap();

        // Profit-taker fills on the next tick.
        let up = BookSnapshot {
            best_ask: 0.72,
            best_bid: 0.70,
            ask_size: 10.0,
            bid_size: 10.0,
            observed_at_ms: 2,
        };
        let down = BookSnapshot::default();
        gw.check_fills("tok-up", &up);
        strategy
            .update_order_status(300, &up, &down, &gw, 11_000)
            .await
            .unwrap();

        let stats = strategy.stats(&|_| None);
        let ending = gw.cash().await;
        let path = reporter
            .finalize(&strategy, &stats, ending, 900_000)
            .unwrap()
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(json["session"]["slug"], "btc-updown-15m-1000");
        assert_eq!(json["session"]["duration_s"], 900);
        assert_eq!(json["wallet"]["starting"], 20.0);
        assert!(json["wallet"]["profitable"].as_bool().unwrap());
        assert_eq!(json["statistics"]["executed_buys"], 1);
        assert_eq!(json["statistics"]["exits"]["limit_sells"], 1);
        assert_eq!(json["statistics"]["exits"]["total"], 1);
        assert_eq!(json["statistics"]["naked_positions"], 0);
        assert_eq!(json["trades"].as_array().unwrap().len(), 2);
        assert_eq!(json["completed_trades"].as_array().unwrap().len(), 1);
        assert!(json["naked_positions"].as_array().unwrap().is_empty());

        let net = json["wallet"]["net_change"].as_f64().unwrap();
        assert!((net - (ending - 20.0)).abs() < 1e-9);
        let realized = json["financial"]["realized"].as_f64().unwrap();
        assert!((realized - net).abs() < 1e-9);

        // Session closed; a second finalize is a no-op.
        assert!(reporter
            .finalize(&strategy, &stats, ending, 901_000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn trade_json_timestamps_are_iso() {
        let t = TradeRecord {
            id: 1,
            order_id: "paper:x".into(),
            timestamp_ms: 1_768_533_300_000,
            slug: "s".into(),
            side: OrderSide::Buy,
            token_id: "tok".into(),
            token_kind: crate::models::TokenKind::Up,
            price: 0.68,
            size: 2.0,
            amount: 1.36,
            status: OrderStatus::Filled,
            paired_with: None,
            exit_kind: None,
        };
        let j = TradeJson::from_record(&t);
        assert!(j.timestamp.starts_with("2026-01-16T03:15:00"));
        assert_eq!(j.side, "BUY");
        assert_eq!(j.token_type, "UP");
        assert_eq!(j.status, "FILLED");
    }
}

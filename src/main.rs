//! ScalpBot: automated scalper for 15-minute UP/DOWN binary markets.
//!
//! Single process, no required flags; configuration comes from the
//! environment. Paper mode by default.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scalpbot::{
    config::Config,
    engine::{
        spawn_monitor, EngineHandles, EnvCredentialProvider, ExecutionGateway, LiveGateway,
        PaperGateway, SessionReporter, StrategyCore, TickScheduler,
    },
    scrapers::{ClobBookClient, MarketDiscovery, SpotFeed},
};

#[derive(Debug, Parser)]
#[command(name = "scalpbot", about = "UP/DOWN binary-market scalping engine")]
struct Cli {
    /// Force paper mode regardless of PAPER_TRADE.
    #[arg(long)]
    paper: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut cfg = Config::from_env().context("configuration invalid")?;
    if cli.paper {
        cfg.paper_trade = true;
    }

    info!(
        asset = cfg.asset.as_str(),
        mode = if cfg.paper_trade { "paper" } else { "live" },
        bankroll = cfg.bankroll,
        "scalpbot starting"
    );

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let spot = SpotFeed::spawn(cfg.asset);
    let discovery = Arc::new(MarketDiscovery::new(http_client.clone(), &cfg));
    let books = Arc::new(ClobBookClient::new(http_client.clone()));

    let (gateway, paper): (Arc<dyn ExecutionGateway>, Option<Arc<PaperGateway>>) =
        if cfg.paper_trade {
            let paper = Arc::new(PaperGateway::new(cfg.bankroll, cfg.min_order_size));
            (paper.clone(), Some(paper))
        } else {
            let live = Arc::new(LiveGateway::new(
                http_client,
                Box::new(EnvCredentialProvider),
                cfg.bankroll,
            ));
            (live, None)
        };

    let now_ms = chrono::Utc::now().timestamp_millis();
    let strategy = Arc::new(AsyncMutex::new(StrategyCore::new(cfg.clone(), now_ms)));
    let reporter = Arc::new(AsyncMutex::new(SessionReporter::new(cfg.report_dir.clone())));
    let shutdown = Arc::new(AtomicBool::new(false));

    let monitor = spawn_monitor(
        cfg.stop_loss_check_interval_ms,
        strategy.clone(),
        gateway.clone(),
        books.clone(),
        shutdown.clone(),
    );

    let scheduler = TickScheduler::new(EngineHandles {
        cfg,
        spot: spot.clone(),
        discovery,
        books,
        gateway,
        paper,
        strategy,
        reporter,
        shutdown: shutdown.clone(),
    });
    let scheduler_task = tokio::spawn(scheduler.run());

    // SIGINT/SIGTERM stop further ticks; the scheduler finalizes the report
    // on its way out. Open positions are left to the operator.
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.store(true, Ordering::Release);
    spot.close();

    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task join failed");
    }
    monitor.abort();

    info!("scalpbot stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

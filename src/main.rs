#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // advancing the epoch lets the background purge return dirty pages
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced");
}

use chrono::Utc;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

use signal_trader::broker::{Broker, PaperBroker, RetryPolicy, RetryingBroker};
use signal_trader::bybit_api::BybitClient;
use signal_trader::config::EngineConfig;
use signal_trader::store::StateStore;
use signal_trader::telegram::{LogNotifier, Notifier, TelegramBot};
use signal_trader::types::{ChainId, GroupId};
use signal_trader::validator::validate_alert;
use signal_trader::LifecycleEngine;

/// Operator commands accepted on the alert feed next to regular alerts.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Control {
    Close { symbol: String, group: String },
    StopChain { symbol: String, chain: String },
    ResetLifetimeLoss,
    SetTier { tier: Option<String> },
    Status,
    /// Price tick for paper trading without a market feed.
    Price { symbol: String, price: f64 },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = EngineConfig::load()?;

    // ── Broker ────────────────────────────────────────────────────────────────
    let paper = Arc::new(PaperBroker::new());
    let live = match BybitClient::from_env()? {
        Some(client) if !config.broker.simulate_orders => Some(client),
        Some(_) => {
            log::info!("simulate_orders set, paper trading");
            None
        }
        None => {
            log::warn!("BYBIT_API_KEY / BYBIT_SECRET not set, paper trading");
            None
        }
    };
    let is_paper = live.is_none();
    let mode = if is_paper { "Paper" } else { "Bybit" };
    let inner: Arc<dyn Broker> = match live {
        Some(client) => Arc::new(client),
        None => paper.clone(),
    };
    let broker: Arc<dyn Broker> = Arc::new(RetryingBroker::new(inner, RetryPolicy::from(&config.broker)));

    // ── Notifier ──────────────────────────────────────────────────────────────
    let tg = TelegramBot::from_env();
    let notifier: Arc<dyn Notifier> = match &tg {
        Some(bot) => Arc::new(bot.clone()),
        None => {
            log::warn!("TELEGRAM_TOKEN / TELEGRAM_CHAT_ID not set, notices go to the log");
            Arc::new(LogNotifier)
        }
    };

    let store = StateStore::new(config.state_path.clone());
    let poll_every = Duration::from_secs(config.price_poll_secs.max(1));
    let status_interval = Duration::from_secs(config.status_interval_secs);
    let engine = Arc::new(LifecycleEngine::new(
        config,
        broker.clone(),
        notifier.clone(),
        Some(store),
        Utc::now().date_naive(),
    ));

    // ── Restore and reconcile after restart ───────────────────────────────────
    match engine.restore_from_store(Utc::now()).await {
        Ok(true) => log::info!("Engine state restored"),
        Ok(false) => log::info!("No stored engine state, starting fresh"),
        Err(e) => log::error!("State restore failed, starting fresh: {}", e),
    }
    match engine.reconcile(Utc::now()).await {
        Ok(n) if n > 0 => log::info!("Reconciled {} degraded groups", n),
        Ok(_) => {}
        Err(e) => log::warn!("Startup reconciliation failed: {}", e),
    }
    engine.refresh_equity().await;

    if let Some(bot) = &tg {
        bot.notify_start(mode, engine.risk_state().equity).await;
    }
    log::info!("Signal trader started | broker: {} | equity {:.2}", mode, engine.risk_state().equity);

    // ── Alert feed: one JSON object per line on stdin ─────────────────────────
    let feed_engine = engine.clone();
    let feed_paper = is_paper.then(|| paper.clone());
    let feed = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => handle_line(&feed_engine, feed_paper.as_deref(), line.trim()).await,
                Ok(None) => {
                    log::info!("Alert feed closed");
                    break;
                }
                Err(e) => {
                    log::error!("Alert feed read failed: {}", e);
                    break;
                }
            }
        }
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(poll_every);
    let mut last_status_ts = Instant::now();
    let mut today = Utc::now().date_naive();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutdown requested");
                break;
            }
        }

        // ── Prices for every symbol with live groups or armed re-entries ──────
        let symbols = engine.watched_symbols().await;
        join_all(symbols.iter().map(|symbol| {
            let engine = engine.clone();
            let broker = broker.clone();
            async move {
                match broker.latest_price(symbol).await {
                    Ok(price) => {
                        engine.on_price(symbol, price, Utc::now()).await;
                    }
                    Err(e) => log::warn!("[{}] Price fetch failed: {}", symbol, e),
                }
            }
        }))
        .await;
        engine.sweep(Utc::now()).await;

        // ── Daily reset at UTC midnight ───────────────────────────────────────
        let now_day = Utc::now().date_naive();
        if now_day != today {
            engine.new_day(now_day).await;
            today = now_day;
        }

        // ── Status report ─────────────────────────────────────────────────────
        if last_status_ts.elapsed() >= status_interval {
            engine.refresh_equity().await;
            if let Err(e) = engine.reconcile(Utc::now()).await {
                log::warn!("Reconciliation failed: {}", e);
            }
            notifier.notify(engine.status_notice().await);
            last_status_ts = Instant::now();

            // Release unused memory pages back to the OS
            #[cfg(feature = "jemalloc")]
            jemalloc_purge();
        }

        if feed.is_finished() && engine.watched_symbols().await.is_empty() {
            log::info!("Alert feed ended and nothing is open, exiting");
            break;
        }
    }

    engine.save_state().await;
    Ok(())
}

async fn handle_line(engine: &LifecycleEngine, paper: Option<&PaperBroker>, line: &str) {
    if line.is_empty() {
        return;
    }
    let payload: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Dropped unparseable feed line: {}", e);
            return;
        }
    };
    let now = Utc::now();

    if payload.get("cmd").is_some() {
        match serde_json::from_value::<Control>(payload) {
            Ok(cmd) => run_control(engine, paper, cmd).await,
            Err(e) => log::warn!("Bad control command: {}", e),
        }
        return;
    }

    // paper fills need a reference price per symbol, keyed like the engine's books
    let Ok(signal) = validate_alert(&payload, now) else {
        // the engine reports the rejection
        if let Err(e) = engine.handle_alert(&payload, now).await {
            log::debug!("Alert not acted on: {}", e);
        }
        return;
    };
    if let Some(paper) = paper {
        paper.set_price(&signal.symbol, signal.price);
    }
    if let Err(e) = engine.handle_signal(signal, now).await {
        log::debug!("Alert not acted on: {}", e);
    }
}

async fn run_control(engine: &LifecycleEngine, paper: Option<&PaperBroker>, cmd: Control) {
    let now = Utc::now();
    match cmd {
        Control::Close { symbol, group } => {
            let symbol = symbol.trim().to_ascii_uppercase();
            if !engine.close_group(&symbol, &GroupId(group.clone()), now).await {
                log::warn!("[{}] Nothing to close for {}", symbol, group);
            }
        }
        Control::StopChain { symbol, chain } => {
            let symbol = symbol.trim().to_ascii_uppercase();
            if !engine.stop_chain(&symbol, &ChainId(chain.clone()), now).await {
                log::warn!("[{}] No active chain {}", symbol, chain);
            }
        }
        Control::ResetLifetimeLoss => engine.reset_lifetime_loss(),
        Control::SetTier { tier } => engine.set_risk_tier(tier),
        Control::Status => {
            let notice = engine.status_notice().await;
            log::info!("{}", signal_trader::telegram::format_notice(&notice).replace('\n', " | "));
        }
        Control::Price { symbol, price } => {
            let symbol = symbol.trim().to_ascii_uppercase();
            if let Some(paper) = paper {
                paper.set_price(&symbol, price);
            }
            engine.on_price(&symbol, price, now).await;
        }
    }
}

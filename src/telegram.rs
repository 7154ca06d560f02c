use crate::events::Notice;

const BASE_URL: &str = "https://api.telegram.org";

/// Fire-and-forget sink for lifecycle notices. Must never block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Logs notices instead of sending them (no Telegram credentials).
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        log::info!("NOTICE {}", format_notice(&notice).replace('\n', " | "));
    }
}

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramBot {
    /// `None` when `TELEGRAM_TOKEN` / `TELEGRAM_CHAT_ID` are not set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(TelegramBot {
            client: reqwest::Client::new(),
            url: format!("{}/bot{}/sendMessage", BASE_URL, token),
            chat_id,
        })
    }

    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
            }
            Ok(resp) => {
                log::warn!("Telegram error status: {}", resp.status());
            }
            Err(e) => {
                log::warn!("Telegram send failed: {}", e);
            }
        }
    }

    pub async fn notify_start(&self, mode: &str, equity: f64) {
        self.send(&format!(
            "🤖 <b>Signal trader started</b>\nMode: {mode} | Equity: <code>${equity:.2}</code>"
        ))
        .await;
    }
}

impl Notifier for TelegramBot {
    fn notify(&self, notice: Notice) {
        let text = format_notice(&notice);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bot = self.clone();
                handle.spawn(async move { bot.send(&text).await });
            }
            Err(_) => log::warn!("No runtime for Telegram, dropped: {}", text.replace('\n', " ")),
        }
    }
}

/// Renders a notice as Telegram HTML.
pub fn format_notice(notice: &Notice) -> String {
    match notice {
        Notice::GroupOpened { symbol, group_id, logic, direction, level, entry, volume_per_leg, stop_loss, take_profit } => {
            let emoji = if direction.side() == "Buy" { "🟢" } else { "🔴" };
            format!(
                "{emoji} <b>Group Opened: {direction} {symbol}</b> ({logic} L{level})\n\
                 Legs:   <code>2 × {volume_per_leg:.4}</code>\n\
                 Entry:  <code>{entry:.5}</code>\n\
                 SL:     <code>{stop_loss:.5}</code>\n\
                 TP:     <code>{take_profit:.5}</code>\n\
                 Group:  <code>{group_id}</code>",
            )
        }
        Notice::LegClosed { symbol, group_id, leg, direction, entry, exit, pnl, reason } => {
            let emoji = if *pnl >= 0.0 { "✅" } else { "❌" };
            format!(
                "{emoji} <b>{leg} Closed: {direction} {symbol}</b>\n\
                 Entry: <code>{entry:.5}</code>  Exit: <code>{exit:.5}</code>\n\
                 PnL:   <code>{pnl:+.2}</code>\n\
                 Reason: {reason}\n\
                 Group: <code>{group_id}</code>",
            )
        }
        Notice::GroupClosed { symbol, group_id, status, pnl } => {
            format!("📦 <b>Group Closed: {symbol}</b> {status}\nPnL: <code>{pnl:+.2}</code>\nGroup: <code>{group_id}</code>")
        }
        Notice::ChainLevelReached { symbol, chain_id, level, level_profit, total_profit } => {
            format!(
                "🪜 <b>Profit Chain L{level}: {symbol}</b>\n\
                 Booked: <code>{level_profit:+.2}</code>  Total: <code>{total_profit:+.2}</code>\n\
                 Chain: <code>{chain_id}</code>",
            )
        }
        Notice::ChainEnded { symbol, chain_id, reason } => {
            format!("🔚 <b>Profit Chain Ended: {symbol}</b>\n{reason}\nChain: <code>{chain_id}</code>")
        }
        Notice::ReEntryTriggered { symbol, trigger, direction, attempt, price } => {
            format!(
                "🔁 <b>Re-entry: {trigger}</b>\n{direction} {symbol} @ <code>{price:.5}</code> (attempt {attempt})",
            )
        }
        Notice::RiskCapBreached { symbol, reason } => {
            format!("⚠️ <b>Risk Alert: {symbol}</b>\n{reason}")
        }
        Notice::SignalRejected { reason } => {
            format!("🚫 <b>Signal Rejected</b>\n{reason}")
        }
        Notice::Degraded { symbol, group_id, error } => {
            format!("🛑 <b>Broker Failure: {symbol}</b>\nGroup <code>{group_id}</code> needs reconciliation\n{error}")
        }
        Notice::Status { lines, equity, daily_pnl, trades_today, trading_enabled } => {
            let status_flag = if *trading_enabled { "✅ active" } else { "⛔ halted" };
            let pnl_emoji = if *daily_pnl >= 0.0 { "📈" } else { "📉" };
            let header = format!(
                "📡 <b>Status</b> | {status_flag}\n\
                 Equity: <code>${equity:.2}</code> | {pnl_emoji} PnL today: <code>{daily_pnl:+.2}</code> | Trades: <code>{trades_today}</code>\n\
                 ─────────────────────"
            );
            if lines.is_empty() {
                format!("{header}\nNo open groups")
            } else {
                format!("{header}\n{}", lines.join("\n"))
            }
        }
        Notice::DailySummary { daily_pnl, trades, wins, equity } => {
            let win_rate = if *trades > 0 { *wins as f64 / *trades as f64 * 100.0 } else { 0.0 };
            format!(
                "📊 <b>Daily Summary</b>\n\
                 PnL:      <code>{daily_pnl:+.2}</code>\n\
                 Trades:   <code>{trades}</code>  Wins: <code>{wins}</code>  WR: <code>{win_rate:.1}%</code>\n\
                 Equity:   <code>{equity:.2}</code>",
            )
        }
    }
}

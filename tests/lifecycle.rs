use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use signal_trader::broker::PaperBroker;
use signal_trader::config::EngineConfig;
use signal_trader::error::{RiskError, ValidationError};
use signal_trader::events::Notice;
use signal_trader::router::LogicVariant;
use signal_trader::store::StateStore;
use signal_trader::telegram::Notifier;
use signal_trader::types::{CloseReason, EntryOrigin, GroupStatus, ReEntryTrigger};
use signal_trader::{EngineError, LifecycleEngine};

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<Notice>>);

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.0.lock().unwrap().push(notice);
    }
}

impl RecordingNotifier {
    fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|n| pred(n)).count()
    }
}

struct Harness {
    engine: LifecycleEngine,
    notices: Arc<RecordingNotifier>,
    clock: DateTime<Utc>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        Self::with_store(config, None)
    }

    fn with_store(config: EngineConfig, store: Option<StateStore>) -> Self {
        let clock = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
        let notices = Arc::new(RecordingNotifier::default());
        let engine = LifecycleEngine::new(
            config,
            Arc::new(PaperBroker::new()),
            notices.clone(),
            store,
            clock.date_naive(),
        );
        Harness { engine, notices, clock }
    }

    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::seconds(15);
        self.clock
    }

    async fn alert(&mut self, payload: Value) -> Result<signal_trader::SignalOutcome, EngineError> {
        let now = self.tick();
        self.engine.handle_alert(&payload, now).await
    }

    async fn prices(&mut self, prices: &[f64]) {
        for p in prices {
            let now = self.tick();
            self.engine.on_price("EURUSD", *p, now).await;
        }
    }
}

fn entry(signal: &str, tf: &str, price: f64) -> Value {
    json!({ "type": "entry", "symbol": "EURUSD", "signal": signal, "tf": tf, "price": price, "strategy": "LuxAlgo" })
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[tokio::test]
async fn buy_entry_opens_two_sized_legs() {
    let mut h = Harness::new(EngineConfig::default());
    let out = h.alert(entry("buy", "5m", 1.1000)).await.unwrap();
    assert_eq!(out.opened.len(), 1);

    let group = h.engine.active_groups("EURUSD").await.remove(0);
    assert_eq!(group.status, GroupStatus::OpenBoth);
    assert_eq!(group.level, 1);
    assert!(group.chain_id.is_some());
    for leg in group.legs() {
        assert!(approx(leg.volume, 0.33));
        assert!(approx(leg.stop_loss, 1.0985));
    }
    assert!(approx(group.tp_trail.take_profit.unwrap(), 1.10225));
    assert!(group.profit_trail.take_profit.is_none());
    assert!(approx(h.engine.risk_state().open_risk, 99.0));
    assert_eq!(h.notices.count(|n| matches!(n, Notice::GroupOpened { .. })), 1);
}

#[tokio::test]
async fn breached_daily_cap_refuses_entry() {
    let mut h = Harness::new(EngineConfig::default());
    let mut snapshot = h.engine.snapshot(h.clock).await;
    snapshot.risk.daily_loss = 250.0;
    h.engine.restore(snapshot, h.clock).await;

    let err = h.alert(entry("buy", "5m", 1.1000)).await.unwrap_err();
    assert!(matches!(err, EngineError::Risk(RiskError::RiskCapExceeded { cap: "daily", .. })));
    assert!(h.engine.active_groups("EURUSD").await.is_empty());
    assert_eq!(h.notices.count(|n| matches!(n, Notice::RiskCapBreached { .. })), 1);
}

#[tokio::test]
async fn missing_timeframe_is_rejected() {
    let mut h = Harness::new(EngineConfig::default());
    let err = h
        .alert(json!({ "type": "entry", "symbol": "EURUSD", "signal": "buy", "price": 1.1, "strategy": "x" }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::MissingField("tf"))));
    assert!(h.engine.active_groups("EURUSD").await.is_empty());
}

#[tokio::test]
async fn unsupported_timeframe_is_rejected() {
    let mut h = Harness::new(EngineConfig::default());
    assert!(matches!(h.alert(entry("buy", "4h", 1.1)).await, Err(EngineError::Route(_))));
    assert_eq!(h.notices.count(|n| matches!(n, Notice::SignalRejected { .. })), 1);
}

#[tokio::test]
async fn profitable_level_compounds_then_chain_breaks() {
    let mut h = Harness::new(EngineConfig::default());
    h.alert(entry("buy", "5m", 1.1000)).await.unwrap();

    // TP leg hits target at 1.1023, profit-trail leg trails out at 1.1025
    h.prices(&[1.1010, 1.1023, 1.1040, 1.1025]).await;

    let chains = h.engine.chains("EURUSD").await;
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].current_level, 2);
    assert!(approx(chains[0].cumulative_profit, 158.4));

    let groups = h.engine.active_groups("EURUSD").await;
    assert_eq!(groups.len(), 1);
    let l2 = &groups[0];
    assert_eq!(l2.level, 2);
    assert!(matches!(l2.origin, EntryOrigin::ChainLevel { level: 2, .. }));
    assert!(approx(l2.entry_price, 1.1025));
    // budget 158.4 * 0.25 * 2 over a 13.5 pip stop
    assert!(approx(l2.tp_trail.volume, 0.29));
    assert!(approx(l2.tp_trail.stop_loss, 1.10115));
    assert_eq!(h.notices.count(|n| matches!(n, Notice::ChainLevelReached { level: 2, .. })), 1);

    h.prices(&[1.1010]).await;
    assert!(h.engine.chains("EURUSD").await.is_empty());
    assert!(h.engine.active_groups("EURUSD").await.is_empty());
    // chain children never arm re-entries
    assert!(h.engine.reentry_contexts("EURUSD").await.is_empty());
    assert_eq!(h.notices.count(|n| matches!(n, Notice::ChainEnded { .. })), 1);
    assert!(approx(h.engine.risk_state().daily_pnl, 158.4 - 87.0));
}

#[tokio::test]
async fn sl_hunt_reenters_after_price_recovers() {
    let mut config = EngineConfig::default();
    config.risk.risk_tier = Some("10000".into());
    let mut h = Harness::new(config);
    let first = h.alert(entry("buy", "5m", 1.1000)).await.unwrap().opened.remove(0);

    h.prices(&[1.0984]).await;
    let contexts = h.engine.reentry_contexts("EURUSD").await;
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].trigger, ReEntryTrigger::SlHunt);
    assert!(approx(contexts[0].trigger_level, 1.1001));

    h.prices(&[1.0995]).await;
    assert!(h.engine.active_groups("EURUSD").await.is_empty());

    h.prices(&[1.1002]).await;
    let groups = h.engine.active_groups("EURUSD").await;
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].origin,
        EntryOrigin::ReEntry { trigger: ReEntryTrigger::SlHunt, origin_group: first, attempt: 1 }
    );
    // remaining daily budget after the 105.6 loss caps the size
    assert!(approx(groups[0].tp_trail.volume, 0.31));
    assert!(h.engine.reentry_contexts("EURUSD").await.is_empty());
    assert_eq!(h.notices.count(|n| matches!(n, Notice::ReEntryTriggered { .. })), 1);
}

#[tokio::test]
async fn tp_continuation_takes_up_same_direction_entry() {
    let mut config = EngineConfig::default();
    config.profit_booking.enabled = false;
    let mut h = Harness::new(config);
    let first = h.alert(entry("buy", "5m", 1.1000)).await.unwrap().opened.remove(0);
    h.prices(&[1.1010, 1.1023, 1.1040, 1.1025]).await;

    assert_eq!(h.engine.group("EURUSD", &first).await.unwrap().status, GroupStatus::ClosedProfit);
    assert_eq!(h.engine.reentry_contexts("EURUSD").await[0].trigger, ReEntryTrigger::TpContinuation);

    let out = h.alert(entry("buy", "5m", 1.1030)).await.unwrap();
    assert_eq!(out.opened.len(), 1);
    let groups = h.engine.active_groups("EURUSD").await;
    assert_eq!(groups.len(), 1);
    assert!(matches!(
        groups[0].origin,
        EntryOrigin::ReEntry { trigger: ReEntryTrigger::TpContinuation, attempt: 1, .. }
    ));
}

#[tokio::test]
async fn trailing_out_in_profit_arms_no_reentry() {
    let mut config = EngineConfig::default();
    config.profit_booking.enabled = false;
    let mut h = Harness::new(config);
    let gid = h.alert(entry("buy", "5m", 1.1000)).await.unwrap().opened.remove(0);
    h.prices(&[1.1020, 1.1005]).await;

    let group = h.engine.group("EURUSD", &gid).await.unwrap();
    assert_eq!(group.status, GroupStatus::ClosedProfit);
    assert!(group.legs().iter().all(|l| l.close_reason == Some(CloseReason::TrailingStop)));
    assert!(h.engine.reentry_contexts("EURUSD").await.is_empty());
}

#[tokio::test]
async fn continuation_leaves_other_timeframes_to_their_own_variant() {
    let mut config = EngineConfig::default();
    config.profit_booking.enabled = false;
    let mut h = Harness::new(config);
    h.alert(entry("buy", "5m", 1.1000)).await.unwrap();
    h.prices(&[1.1010, 1.1023, 1.1040, 1.1025]).await;
    let contexts = h.engine.reentry_contexts("EURUSD").await;
    assert_eq!(contexts.len(), 1);
    assert_eq!((contexts[0].trigger, contexts[0].logic), (ReEntryTrigger::TpContinuation, LogicVariant::Logic1));

    let out = h.alert(entry("buy", "1h", 1.1030)).await.unwrap();
    assert_eq!(out.opened.len(), 1);
    let groups = h.engine.active_groups("EURUSD").await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].logic, LogicVariant::Logic3);
    assert_eq!(groups[0].origin, EntryOrigin::Fresh);
    // the 5m continuation is still waiting for a 5m entry
    assert_eq!(h.engine.reentry_contexts("EURUSD").await.len(), 1);
    assert_eq!(h.notices.count(|n| matches!(n, Notice::ReEntryTriggered { .. })), 0);
}

#[tokio::test]
async fn level_target_books_both_legs_and_compounds() {
    let mut config = EngineConfig::default();
    config.profit_booking.profit_targets = vec![50.0, 100.0];
    let mut h = Harness::new(config);
    let first = h.alert(entry("buy", "5m", 1.1000)).await.unwrap().opened.remove(0);

    // 7 pips on 0.66 lots is 46.2, short of the target
    h.prices(&[1.1007]).await;
    assert_eq!(h.engine.active_groups("EURUSD").await[0].id, first);

    h.prices(&[1.1008]).await;
    let booked = h.engine.group("EURUSD", &first).await.unwrap();
    assert_eq!(booked.status, GroupStatus::ClosedProfit);
    assert!(booked.legs().iter().all(|l| l.close_reason == Some(CloseReason::ProfitBooking)));
    assert!(approx(booked.realized_pnl(), 52.8));

    let chains = h.engine.chains("EURUSD").await;
    assert_eq!(chains[0].current_level, 2);
    let l2 = h.engine.active_groups("EURUSD").await.remove(0);
    assert_eq!(l2.level, 2);
    assert!(approx(l2.entry_price, 1.1008));
    // budget 52.8 * 0.25 * 2 over a 13.5 pip stop
    assert!(approx(l2.tp_trail.volume, 0.09));
    assert!(approx(l2.tp_trail.stop_loss, 1.09945));
    assert!(h.engine.reentry_contexts("EURUSD").await.is_empty());
}

#[tokio::test]
async fn early_warning_only_closes_winning_groups() {
    let mut h = Harness::new(EngineConfig::default());
    let gid = h.alert(entry("buy", "5m", 1.1000)).await.unwrap().opened.remove(0);
    let exit = |price: f64| json!({ "type": "exit", "symbol": "EURUSD", "signal": "buy", "tf": "5m", "price": price, "strategy": "LuxAlgo" });

    let out = h.alert(exit(1.0995)).await.unwrap();
    assert!(out.closed.is_empty());

    let out = h.alert(exit(1.1006)).await.unwrap();
    assert_eq!(out.closed, vec![gid.clone()]);
    let group = h.engine.group("EURUSD", &gid).await.unwrap();
    assert_eq!(group.status, GroupStatus::ClosedManual);
    assert!(group.realized_pnl() > 0.0);
}

#[tokio::test]
async fn opposite_entry_flips_the_slot() {
    let mut h = Harness::new(EngineConfig::default());
    let buy = h.alert(entry("buy", "5m", 1.1000)).await.unwrap().opened.remove(0);
    let out = h.alert(entry("sell", "5m", 1.0995)).await.unwrap();

    assert_eq!(out.closed, vec![buy]);
    assert_eq!(out.opened.len(), 1);
    let groups = h.engine.active_groups("EURUSD").await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].direction, signal_trader::types::Direction::Sell);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine_state.json");

    let mut h = Harness::with_store(EngineConfig::default(), Some(StateStore::new(&path)));
    let gid = h.alert(entry("buy", "15m", 1.1000)).await.unwrap().opened.remove(0);
    let open_risk = h.engine.risk_state().open_risk;

    let restarted = Harness::with_store(EngineConfig::default(), Some(StateStore::new(&path)));
    assert!(restarted.engine.restore_from_store(restarted.clock).await.unwrap());
    let groups = restarted.engine.active_groups("EURUSD").await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, gid);
    assert_eq!(restarted.engine.chains("EURUSD").await.len(), 1);
    assert!(approx(restarted.engine.risk_state().open_risk, open_risk));
    assert_eq!(restarted.engine.watched_symbols().await, vec!["EURUSD".to_string()]);
}

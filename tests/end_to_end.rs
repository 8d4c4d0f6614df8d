//! Full-engine scenarios driven entirely through the dispatcher's command
//! surface, mirroring the teacher's `matching_wal/integration_tests.rs`
//! style of exercising the whole stack rather than one module at a time.

use std::collections::HashMap;
use std::sync::Mutex;

use matching_core::balance::Ledger;
use matching_core::bus::BusSink;
use matching_core::config::AppConfig;
use matching_core::core_types::{BalanceKind, Side};
use matching_core::dispatcher::{Command, Dispatcher, Reply};
use matching_core::engine::Engine;
use matching_core::history::{HistoryRow, HistorySink, Stream};
use matching_core::messages::{BusMessage, OperlogEntry};
use matching_core::operlog::{table_name_for_day, OperlogSink};
use matching_core::registry::{Asset, Market, Registry};
use matching_core::snapshot::{self, OperlogSource, SnapshotSink};
use rust_decimal::Decimal;

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn market(stock_prec: u32, money_prec: u32) -> Market {
    Market {
        name: "STKMNY".into(),
        stock: "STK".into(),
        money: "MNY".into(),
        stock_prec,
        money_prec,
        fee_prec: 4,
        min_amount: d("0.0001"),
    }
}

fn dispatcher_for(m: Market) -> Dispatcher {
    let registry = Registry::new(
        vec![
            Asset { name: "STK".into(), prec_save: 8, prec_show: 4 },
            Asset { name: "MNY".into(), prec_save: 8, prec_show: 2 },
        ],
        vec![m],
    )
    .unwrap();
    let mut ledger = Ledger::new();
    ledger.register_asset("STK", 8);
    ledger.register_asset("MNY", 8);
    Dispatcher::new(Engine::new(registry, ledger), &AppConfig::default())
}

fn limit(market: &str, user_id: u32, side: Side, amount: &str, price: &str, taker_fee: &str, maker_fee: &str) -> Command {
    Command::OrderPutLimit {
        market: market.into(),
        user_id,
        side,
        amount: d(amount),
        price: d(price),
        taker_fee: d(taker_fee),
        maker_fee: d(maker_fee),
        source: "api".into(),
    }
}

#[test]
fn simple_limit_cross_executes_at_maker_price() {
    let mut d1 = dispatcher_for(market(4, 4));
    d1.engine.ledger.add(1, BalanceKind::Available, "STK", d("10")).unwrap();
    d1.engine.ledger.add(2, BalanceKind::Available, "MNY", d("1000")).unwrap();

    let ask = d1.dispatch(1.0, true, limit("STKMNY", 1, Side::Ask, "1", "100", "0", "0")).unwrap();
    let bid = d1.dispatch(2.0, true, limit("STKMNY", 2, Side::Bid, "1", "100", "0", "0")).unwrap();

    assert!(matches!(ask, Reply::OrderId(1)));
    assert!(matches!(bid, Reply::OrderId(2)));
    assert_eq!(d1.engine.order_id_seq(), 2);
    assert_eq!(d1.engine.deal_id_seq(), 1);

    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Available, "MNY"), Some(d("100")));
    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Available, "STK"), None);
    assert_eq!(d1.engine.ledger.get(2, BalanceKind::Available, "STK"), Some(d("1")));
    assert_eq!(d1.engine.ledger.get(2, BalanceKind::Available, "MNY"), Some(d("900")));
    assert_eq!(d1.engine.book("STKMNY").unwrap().depth_levels(), (0, 0));
}

#[test]
fn partial_fill_charges_fees_on_both_sides() {
    let mut d1 = dispatcher_for(market(4, 4));
    d1.engine.ledger.add(1, BalanceKind::Available, "STK", d("10")).unwrap();
    d1.engine.ledger.add(2, BalanceKind::Available, "MNY", d("1000")).unwrap();

    let ask = d1.dispatch(1.0, true, limit("STKMNY", 1, Side::Ask, "5", "10", "0", "0.001")).unwrap();
    let Reply::OrderId(ask_id) = ask else { panic!("expected OrderId") };
    d1.dispatch(2.0, true, limit("STKMNY", 2, Side::Bid, "3", "10", "0.002", "0")).unwrap();

    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Frozen, "STK"), Some(d("2")));
    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Available, "STK"), Some(d("5")));
    // maker (ask, maker_fee=0.001) receives money and pays its fee in money: 30 - 30*0.001
    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Available, "MNY"), Some(d("29.97")));
    // taker (bid, taker_fee=0.002) receives stock and pays its fee in stock: 3 - 3*0.002
    assert_eq!(d1.engine.ledger.get(2, BalanceKind::Available, "STK"), Some(d("2.994")));
    assert_eq!(d1.engine.ledger.get(2, BalanceKind::Available, "MNY"), Some(d("970")));

    let resting = d1.engine.get_order("STKMNY", ask_id).unwrap();
    assert_eq!(resting.left, d("2"));
    assert_eq!(resting.freeze, d("2"));
}

#[test]
fn market_buy_rounds_exec_amount_down_to_stock_precision() {
    let mut d1 = dispatcher_for(market(4, 8));
    d1.engine.ledger.add(1, BalanceKind::Available, "STK", d("3")).unwrap();
    d1.engine.ledger.add(2, BalanceKind::Available, "MNY", d("10")).unwrap();

    d1.dispatch(1.0, true, limit("STKMNY", 1, Side::Ask, "1", "7.03", "0", "0")).unwrap();
    d1.dispatch(1.0, true, limit("STKMNY", 1, Side::Ask, "2", "7.05", "0", "0")).unwrap();

    let reply = d1
        .dispatch(
            2.0,
            true,
            Command::OrderPutMarket {
                market: "STKMNY".into(),
                user_id: 2,
                side: Side::Bid,
                amount: d("10"),
                taker_fee: Decimal::ZERO,
                source: "api".into(),
            },
        )
        .unwrap();
    let Reply::OrderId(order_id) = reply else { panic!("expected OrderId") };

    assert_eq!(d1.engine.ledger.get(2, BalanceKind::Available, "STK"), Some(d("1.4212")));
    // 10 - 7.03 - 2.96946 = 0.00054 left unspent, discarded since market orders never rest.
    assert_eq!(d1.engine.ledger.get(2, BalanceKind::Available, "MNY"), Some(d("0.00054")));
    assert_eq!(d1.engine.book("STKMNY").unwrap().get(order_id), None);
}

#[test]
fn cancel_unfreezes_and_emits_finish_without_trading() {
    let mut d1 = dispatcher_for(market(4, 4));
    d1.engine.ledger.add(1, BalanceKind::Available, "MNY", d("1000")).unwrap();

    let reply = d1.dispatch(1.0, true, limit("STKMNY", 1, Side::Bid, "2", "50", "0", "0")).unwrap();
    let Reply::OrderId(order_id) = reply else { panic!("expected OrderId") };
    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Frozen, "MNY"), Some(d("100")));

    d1.dispatch(2.0, true, Command::OrderCancel { market: "STKMNY".into(), order_id }).unwrap();

    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Available, "MNY"), Some(d("1000")));
    assert_eq!(d1.engine.ledger.get(1, BalanceKind::Frozen, "MNY"), None);
    assert_eq!(d1.engine.book("STKMNY").unwrap().get(order_id), None);
}

#[test]
fn idempotent_balance_update_is_a_noop_on_repeat_and_mutates_again_after_sweep() {
    let mut d1 = dispatcher_for(market(4, 4));
    let cmd = Command::BalanceUpdate {
        user_id: 7,
        asset: "STK".into(),
        business: "deposit".into(),
        business_id: 42,
        delta: d("1.5"),
    };

    d1.dispatch(0.0, true, cmd.clone()).unwrap();
    d1.dispatch(10.0, true, cmd.clone()).unwrap();
    assert_eq!(d1.engine.ledger.get(7, BalanceKind::Available, "STK"), Some(d("1.5")));

    // Past the 24h retention window, the same business id is free to mutate again.
    d1.tick_housekeeping(0.0 + 25.0 * 3600.0);
    d1.dispatch(25.0 * 3600.0 + 1.0, true, cmd).unwrap();
    assert_eq!(d1.engine.ledger.get(7, BalanceKind::Available, "STK"), Some(d("3.0")));
}

#[derive(Default)]
struct MemStore {
    operlog: Mutex<HashMap<String, Vec<OperlogEntry>>>,
    balances: Mutex<Vec<matching_core::snapshot::BalanceRow>>,
    orders: Mutex<Vec<matching_core::snapshot::OrderRow>>,
    markers: Mutex<Vec<matching_core::snapshot::SnapshotMarker>>,
}

#[async_trait::async_trait]
impl OperlogSink for MemStore {
    async fn write_batch(&self, table: &str, entries: &[OperlogEntry]) -> anyhow::Result<()> {
        self.operlog.lock().unwrap().entry(table.to_string()).or_default().extend(entries.iter().cloned());
        Ok(())
    }
}

#[async_trait::async_trait]
impl OperlogSource for MemStore {
    async fn read_since(&self, table: &str, after_id: u64) -> anyhow::Result<Vec<OperlogEntry>> {
        Ok(self
            .operlog
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.iter().filter(|r| r.id > after_id).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl SnapshotSink for MemStore {
    async fn write_balances(&self, _ts: i64, rows: &[matching_core::snapshot::BalanceRow]) -> anyhow::Result<()> {
        self.balances.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }
    async fn write_orders(&self, _ts: i64, rows: &[matching_core::snapshot::OrderRow]) -> anyhow::Result<()> {
        self.orders.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }
    async fn write_marker(&self, marker: &matching_core::snapshot::SnapshotMarker) -> anyhow::Result<()> {
        self.markers.lock().unwrap().push(*marker);
        Ok(())
    }
    async fn latest_marker(&self) -> anyhow::Result<Option<matching_core::snapshot::SnapshotMarker>> {
        Ok(self.markers.lock().unwrap().iter().max_by_key(|m| m.ts).copied())
    }
    async fn load_balances(&self, ts: i64) -> anyhow::Result<Vec<matching_core::snapshot::BalanceRow>> {
        let _ = ts;
        Ok(self.balances.lock().unwrap().clone())
    }
    async fn load_orders(&self, ts: i64) -> anyhow::Result<Vec<matching_core::snapshot::OrderRow>> {
        let _ = ts;
        Ok(self.orders.lock().unwrap().clone())
    }
    async fn list_markers(&self) -> anyhow::Result<Vec<matching_core::snapshot::SnapshotMarker>> {
        Ok(self.markers.lock().unwrap().clone())
    }
    async fn delete_slice(&self, ts: i64) -> anyhow::Result<()> {
        self.markers.lock().unwrap().retain(|m| m.ts != ts);
        Ok(())
    }
}

#[derive(Default)]
struct CountingHistorySink {
    rows_written: Mutex<usize>,
}

#[async_trait::async_trait]
impl HistorySink for CountingHistorySink {
    async fn write_rows(&self, _stream: Stream, _partition: u64, rows: &[HistoryRow]) -> anyhow::Result<()> {
        *self.rows_written.lock().unwrap() += rows.len();
        Ok(())
    }
}

#[derive(Default)]
struct CountingBusSink {
    messages_published: Mutex<usize>,
}

#[async_trait::async_trait]
impl BusSink for CountingBusSink {
    async fn publish(&self, _topic: &str, _message: &BusMessage) -> anyhow::Result<()> {
        *self.messages_published.lock().unwrap() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn snapshot_then_restart_reproduces_pre_kill_state_without_replay_duplicates() {
    let mut d1 = dispatcher_for(market(4, 4));
    d1.engine.ledger.add(1, BalanceKind::Available, "STK", d("10")).unwrap();
    d1.engine.ledger.add(2, BalanceKind::Available, "MNY", d("1000")).unwrap();

    // Scenarios (1)-(4): cross, partial fill, cancel.
    d1.dispatch(1.0, true, limit("STKMNY", 1, Side::Ask, "1", "100", "0", "0")).unwrap();
    d1.dispatch(2.0, true, limit("STKMNY", 2, Side::Bid, "1", "100", "0", "0")).unwrap();
    let Reply::OrderId(resting_id) = d1.dispatch(3.0, true, limit("STKMNY", 1, Side::Ask, "5", "10", "0", "0")).unwrap() else {
        panic!("expected OrderId")
    };
    d1.dispatch(4.0, true, limit("STKMNY", 2, Side::Bid, "3", "10", "0", "0")).unwrap();
    d1.dispatch(5.0, true, Command::OrderCancel { market: "STKMNY".into(), order_id: resting_id }).unwrap();

    let store = MemStore::default();
    let history_sink = CountingHistorySink::default();
    let bus_sink = CountingBusSink::default();
    let table = table_name_for_day(19000);
    d1.flush_sinks(&store, &history_sink, &bus_sink, &table).await;

    // Trigger `makeslice`.
    let data = snapshot::capture(&d1.engine, 1_000, d1.operlog_id_seq(), 19000);
    snapshot::persist(&store, &data).await.unwrap();

    // Three more successful limits/cancels after the slice.
    let Reply::OrderId(post_slice_id) = d1.dispatch(6.0, true, limit("STKMNY", 1, Side::Bid, "1", "20", "0", "0")).unwrap()
    else {
        panic!("expected OrderId")
    };
    d1.dispatch(7.0, true, limit("STKMNY", 2, Side::Ask, "0.5", "15", "0", "0")).unwrap();
    d1.dispatch(8.0, true, Command::OrderCancel { market: "STKMNY".into(), order_id: post_slice_id }).unwrap();
    d1.flush_sinks(&store, &history_sink, &bus_sink, &table).await;

    let pre_kill_order_id_seq = d1.engine.order_id_seq();
    let pre_kill_deal_id_seq = d1.engine.deal_id_seq();
    let pre_kill_operlog_id_seq = d1.operlog_id_seq();
    let pre_kill_stk = d1.engine.ledger.get(1, BalanceKind::Available, "STK");
    let pre_kill_mny = d1.engine.ledger.get(2, BalanceKind::Available, "MNY");
    let pre_kill_depth = d1.engine.book("STKMNY").unwrap().depth_levels();

    // Kill the process; restart against the same store.
    drop(d1);
    let mut d2 = dispatcher_for(market(4, 4));
    snapshot::restore(&mut d2, &store, &store, 19000).await.unwrap();

    // Replay runs every carried-over command through `dispatch(real=false)`,
    // which short-circuits `route_events` before it ever buffers a history
    // row or bus message -- flushing right after restore must be a no-op.
    let replay_history = CountingHistorySink::default();
    let replay_bus = CountingBusSink::default();
    d2.flush_sinks(&store, &replay_history, &replay_bus, &table).await;
    assert_eq!(*replay_history.rows_written.lock().unwrap(), 0);
    assert_eq!(*replay_bus.messages_published.lock().unwrap(), 0);

    assert_eq!(d2.engine.order_id_seq(), pre_kill_order_id_seq);
    assert_eq!(d2.engine.deal_id_seq(), pre_kill_deal_id_seq);
    assert_eq!(d2.operlog_id_seq(), pre_kill_operlog_id_seq);
    assert_eq!(d2.engine.ledger.get(1, BalanceKind::Available, "STK"), pre_kill_stk);
    assert_eq!(d2.engine.ledger.get(2, BalanceKind::Available, "MNY"), pre_kill_mny);
    assert_eq!(d2.engine.book("STKMNY").unwrap().depth_levels(), pre_kill_depth);
}

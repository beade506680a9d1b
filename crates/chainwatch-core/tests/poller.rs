//! End-to-end polling against in-memory collaborators

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainwatch::alerting::{AlertDeduplicator, AlertSink, ChannelSink, CycleReport, StateDiffPoller};
use chainwatch::governor::{BackoffRetrier, ConcurrencyLimiter, RequestGovernor, TokenBucket};
use chainwatch::models::{
    AlertEvent, AlertKind, HoldingSnapshot, ItemId, Snapshot, SupplySnapshot, Target, TargetKind,
};
use chainwatch::provider::SnapshotSource;
use chainwatch::store::{MemoryStore, TargetStore};
use chainwatch::{Error, Result};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

const WALLET: &str = "0xabcdef0123456789abcdef0123456789abcdef01";
const OTHER_WALLET: &str = "0x1234567890123456789012345678901234567890";

#[derive(Default)]
struct FakeSource {
    snapshots: Mutex<HashMap<(String, String), Snapshot>>,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    pair_delays: Mutex<HashMap<(String, String), Duration>>,
}

impl FakeSource {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn set(&self, target_id: &str, chain: &str, snapshot: Snapshot) {
        self.snapshots
            .lock()
            .insert((target_id.to_string(), chain.to_string()), snapshot);
    }

    fn holdings(&self, target_id: &str, chain: &str, tokens: &[&str]) {
        self.set(
            target_id,
            chain,
            Snapshot::Holding(HoldingSnapshot::from_ids(tokens.iter().map(|t| item(t)))),
        );
    }

    fn supply(&self, target_id: &str, chain: &str, count: u64) {
        self.set(target_id, chain, Snapshot::Supply(SupplySnapshot::with_count(count)));
    }

    fn fail(&self, target_id: &str) {
        self.failing.lock().insert(target_id.to_string());
    }

    fn slow_pair(&self, target_id: &str, chain: &str, delay: Duration) {
        self.pair_delays
            .lock()
            .insert((target_id.to_string(), chain.to_string()), delay);
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch_snapshot(&self, target: &Target, chain: &str) -> Result<Snapshot> {
        let pair_delay = self
            .pair_delays
            .lock()
            .get(&(target.id.clone(), chain.to_string()))
            .copied();
        if let Some(delay) = self.delay.or(pair_delay) {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&target.id) {
            return Err(Error::network("connection reset"));
        }
        let snapshot = self
            .snapshots
            .lock()
            .get(&(target.id.clone(), chain.to_string()))
            .cloned();
        snapshot.ok_or_else(|| Error::provider_data("nothing scripted"))
    }

    fn supports_chain(&self, chain: &str) -> bool {
        chain != "solana"
    }
}

struct RejectingSink;

#[async_trait]
impl AlertSink for RejectingSink {
    async fn deliver(&self, _event: &AlertEvent) -> Result<()> {
        Err(Error::delivery("webhook returned 500"))
    }
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn item(token: &str) -> ItemId {
    ItemId::new("0xaaa", token)
}

fn governor() -> Arc<RequestGovernor> {
    Arc::new(RequestGovernor::new(
        Arc::new(TokenBucket::new(1_000, 1_000, Duration::from_secs(1))),
        ConcurrencyLimiter::new(4),
        BackoffRetrier::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0),
        CancellationToken::new(),
    ))
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<FakeSource>,
    poller: StateDiffPoller,
    alerts: UnboundedReceiver<AlertEvent>,
}

impl Harness {
    fn new(targets: Vec<Target>) -> Self {
        Self::with_source(targets, FakeSource::default())
    }

    fn with_source(targets: Vec<Target>, source: FakeSource) -> Self {
        let (sink, alerts) = ChannelSink::new();
        let store = Arc::new(MemoryStore::new(targets));
        let source = Arc::new(source);
        let poller = StateDiffPoller::new(
            store.clone(),
            source.clone(),
            Arc::new(sink),
            governor(),
            Arc::new(AlertDeduplicator::new(Duration::from_secs(600), 1_000)),
        );
        Self {
            store,
            source,
            poller,
            alerts,
        }
    }

    async fn holding_cycle(&self) -> CycleReport {
        self.poller.run_cycle(TargetKind::HoldingWatch).await.unwrap()
    }

    async fn supply_cycle(&self) -> CycleReport {
        self.poller.run_cycle(TargetKind::SupplyWatch).await.unwrap()
    }

    fn drain(&mut self) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.alerts.try_recv() {
            events.push(event);
        }
        events
    }
}

#[tokio::test]
async fn test_first_tick_primes_without_alerts() {
    let mut h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["ethereum"])]);
    h.source.holdings("w1", "ethereum", &["1", "2", "3"]);

    let report = h.holding_cycle().await;

    assert_eq!(report.processed, 1);
    assert_eq!(report.delivered, 0);
    assert!(h.drain().is_empty());
    assert_eq!(h.poller.baseline("w1", "ethereum").map(|b| b.len()), Some(3));
}

#[tokio::test]
async fn test_new_item_alerts_once_and_replaces_baseline() {
    let mut h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["ethereum"])]);
    h.source.holdings("w1", "ethereum", &["A", "B"]);
    h.holding_cycle().await;

    h.source.holdings("w1", "ethereum", &["A", "B", "C"]);
    let report = h.holding_cycle().await;

    let alerts = h.drain();
    assert_eq!(report.delivered, 1);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::NewHolding { item: item("C") });
    assert_eq!(alerts[0].chain, "ethereum");
    assert_eq!(
        h.poller.baseline("w1", "ethereum"),
        Some([item("A"), item("B"), item("C")].into())
    );

    // unchanged holdings stay quiet
    h.holding_cycle().await;
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_chains_are_primed_independently() {
    let mut h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["ethereum", "polygon"])]);
    h.source.holdings("w1", "ethereum", &["1"]);
    h.source.holdings("w1", "polygon", &["1"]);
    h.holding_cycle().await;

    h.source.holdings("w1", "polygon", &["1", "2"]);
    h.holding_cycle().await;

    let alerts = h.drain();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].chain, "polygon");
}

#[tokio::test]
async fn test_supply_latch_and_reset() {
    let mut h = Harness::new(vec![Target::supply_watch("c1", "boredapes", "ethereum", 100)]);

    h.source.supply("c1", "ethereum", 120);
    h.supply_cycle().await;
    assert_eq!(h.drain().len(), 1);
    assert!(h.store.get("c1").unwrap().latched);

    h.source.supply("c1", "ethereum", 130);
    h.supply_cycle().await;
    assert!(h.drain().is_empty());

    h.poller.reset_latch("c1").await.unwrap();
    assert!(!h.store.get("c1").unwrap().latched);

    h.source.supply("c1", "ethereum", 131);
    h.supply_cycle().await;
    let alerts = h.drain();
    assert_eq!(alerts.len(), 1);
    assert_eq!(
        alerts[0].kind,
        AlertKind::SupplyThreshold { count: 131, threshold: 100 }
    );
}

#[tokio::test]
async fn test_reset_allows_same_count_to_fire_again() {
    let mut h = Harness::new(vec![Target::supply_watch("c1", "boredapes", "ethereum", 100)]);
    h.source.supply("c1", "ethereum", 120);

    h.supply_cycle().await;
    h.poller.reset_latch("c1").await.unwrap();
    let report = h.supply_cycle().await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.suppressed, 0);
    assert_eq!(h.drain().len(), 2);
}

#[tokio::test]
async fn test_threshold_fifty_end_to_end() {
    let mut h = Harness::new(vec![Target::supply_watch("c1", "0xcontract", "ethereum", 50)]);

    h.source.supply("c1", "ethereum", 50);
    h.supply_cycle().await;

    let alerts = h.drain();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::SupplyThreshold { count: 50, threshold: 50 });
    assert!(alerts[0].payload.message.contains("50"));
    assert!(h.store.get("c1").unwrap().latched);

    h.source.supply("c1", "ethereum", 75);
    h.supply_cycle().await;
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_below_threshold_leaves_latch_clear() {
    let mut h = Harness::new(vec![Target::supply_watch("c1", "slug", "ethereum", 50)]);
    h.source.supply("c1", "ethereum", 49);

    h.supply_cycle().await;

    assert!(h.drain().is_empty());
    assert!(!h.store.get("c1").unwrap().latched);
}

#[tokio::test]
async fn test_multi_chain_supply_fires_once_per_latch() {
    let mut h = Harness::new(vec![Target {
        chains: vec!["ethereum".to_string(), "polygon".to_string()],
        ..Target::supply_watch("c1", "slug", "ethereum", 10)
    }]);
    h.source.supply("c1", "ethereum", 11);
    h.source.supply("c1", "polygon", 12);

    let report = h.supply_cycle().await;

    assert_eq!(report.processed, 2);
    assert_eq!(h.drain().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_chain_from_earlier_cycle_does_not_fire_again() {
    let mut h = Harness::new(vec![Target {
        chains: vec!["ethereum".to_string(), "polygon".to_string()],
        ..Target::supply_watch("c1", "slug", "ethereum", 10)
    }]);
    h.source.slow_pair("c1", "ethereum", Duration::from_millis(200));
    h.source.supply("c1", "ethereum", 11);
    h.source.supply("c1", "polygon", 5);

    let first = h.supply_cycle();
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.source.supply("c1", "polygon", 12);
        h.supply_cycle().await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(second.skipped, 1);
    assert_eq!(first.delivered + second.delivered, 1);
    assert_eq!(h.drain().len(), 1);
    assert!(h.store.get("c1").unwrap().latched);
}

#[tokio::test]
async fn test_latch_cleared_in_store_is_picked_up() {
    let mut h = Harness::new(vec![Target::supply_watch("c1", "boredapes", "ethereum", 100)]);
    h.source.supply("c1", "ethereum", 120);
    h.supply_cycle().await;
    assert_eq!(h.drain().len(), 1);

    // cleared by another process, not through this poller
    h.store.set_latch("c1", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = h.supply_cycle().await;

    assert_eq!(report.delivered, 1);
    assert_eq!(h.drain().len(), 1);
    assert!(h.store.get("c1").unwrap().latched);
}

#[tokio::test]
async fn test_failing_target_does_not_block_others() {
    let mut h = Harness::new(vec![
        Target::holding_watch("bad", OTHER_WALLET, ["ethereum"]),
        Target::holding_watch("good", WALLET, ["ethereum"]),
    ]);
    h.source.fail("bad");
    h.source.holdings("good", "ethereum", &["1"]);
    h.holding_cycle().await;

    h.source.holdings("good", "ethereum", &["1", "2"]);
    let report = h.holding_cycle().await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 1);
    let alerts = h.drain();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].target_id, "good");
    assert!(h.poller.baseline("bad", "ethereum").is_none());
}

#[tokio::test]
async fn test_failed_fetch_keeps_previous_baseline() {
    let mut h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["ethereum"])]);
    h.source.holdings("w1", "ethereum", &["1"]);
    h.holding_cycle().await;

    h.source.fail("w1");
    assert_eq!(h.holding_cycle().await.failed, 1);
    assert_eq!(h.poller.baseline("w1", "ethereum"), Some([item("1")].into()));
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_repeat_within_ttl_is_suppressed() {
    let mut h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["ethereum"])]);
    h.source.holdings("w1", "ethereum", &["1"]);
    h.holding_cycle().await;

    h.source.holdings("w1", "ethereum", &["1", "2"]);
    h.holding_cycle().await;
    h.source.holdings("w1", "ethereum", &["1"]);
    h.holding_cycle().await;
    h.source.holdings("w1", "ethereum", &["1", "2"]);
    let report = h.holding_cycle().await;

    assert_eq!(report.suppressed, 1);
    assert_eq!(h.drain().len(), 1);
}

#[tokio::test]
async fn test_delivery_failure_keeps_state_changes() {
    let store = Arc::new(MemoryStore::new(vec![
        Target::supply_watch("c1", "slug", "ethereum", 10),
        Target::holding_watch("w1", WALLET, ["ethereum"]),
    ]));
    let source = Arc::new(FakeSource::default());
    let poller = StateDiffPoller::new(
        store.clone(),
        source.clone(),
        Arc::new(RejectingSink),
        governor(),
        Arc::new(AlertDeduplicator::default()),
    );

    source.supply("c1", "ethereum", 10);
    let report = poller.run_cycle(TargetKind::SupplyWatch).await.unwrap();
    assert_eq!(report.delivery_failed, 1);
    assert!(store.get("c1").unwrap().latched);

    source.holdings("w1", "ethereum", &["1"]);
    poller.run_cycle(TargetKind::HoldingWatch).await.unwrap();
    source.holdings("w1", "ethereum", &["1", "2"]);
    let report = poller.run_cycle(TargetKind::HoldingWatch).await.unwrap();
    assert_eq!(report.delivery_failed, 1);
    assert_eq!(poller.baseline("w1", "ethereum").map(|b| b.len()), Some(2));
}

#[tokio::test]
async fn test_removed_targets_and_chains_lose_baselines() {
    let h = Harness::new(vec![
        Target::holding_watch("w1", WALLET, ["ethereum", "polygon"]),
        Target::holding_watch("w2", OTHER_WALLET, ["ethereum"]),
    ]);
    h.source.holdings("w1", "ethereum", &["1"]);
    h.source.holdings("w1", "polygon", &["1"]);
    h.source.holdings("w2", "ethereum", &["1"]);
    h.holding_cycle().await;
    assert!(h.poller.baseline("w2", "ethereum").is_some());

    assert!(h.store.remove("w2"));
    h.store.upsert(Target::holding_watch("w1", WALLET, ["ethereum"]));
    h.supply_cycle().await;
    assert!(h.poller.baseline("w2", "ethereum").is_some());

    h.holding_cycle().await;

    assert!(h.poller.baseline("w1", "ethereum").is_some());
    assert!(h.poller.baseline("w1", "polygon").is_none());
    assert!(h.poller.baseline("w2", "ethereum").is_none());
}

#[tokio::test]
async fn test_retry_warnings_name_target_and_chain() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = Harness::new(vec![Target::holding_watch("bad", OTHER_WALLET, ["polygon"])]);
    h.source.fail("bad");
    assert_eq!(h.holding_cycle().await.failed, 1);

    let contents = logs.contents();
    let backoff = contents
        .lines()
        .find(|line| line.contains("Request failed, backing off"))
        .expect("retry warning logged");
    assert!(backoff.contains("target_id="), "{backoff}");
    assert!(backoff.contains("bad"), "{backoff}");
    assert!(backoff.contains("chain="), "{backoff}");
    assert!(backoff.contains("polygon"), "{backoff}");
    assert!(backoff.contains("attempt=1"), "{backoff}");

    let exhausted = contents
        .lines()
        .find(|line| line.contains("Retries exhausted"))
        .expect("exhaustion logged");
    assert!(exhausted.contains("attempts=3"), "{exhausted}");
    assert!(exhausted.contains("polygon"), "{exhausted}");
}

#[tokio::test]
async fn test_check_target_reports_each_chain_without_priming() {
    let h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["solana", "ethereum"])]);
    h.source.holdings("w1", "ethereum", &["1", "2"]);

    let results = h.poller.check_target("w1").await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "ethereum");
    assert!(matches!(&results[0].1, Ok(Snapshot::Holding(holdings)) if holdings.len() == 2));
    assert_eq!(results[1].0, "solana");
    assert!(matches!(results[1].1, Err(Error::Validation(_))));
    assert!(h.poller.baseline("w1", "ethereum").is_none());

    assert!(matches!(
        h.poller.check_target("missing").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_invalid_targets_and_unsupported_chains_are_skipped() {
    let h = Harness::new(vec![
        Target::holding_watch("bad-address", "not-an-address", ["ethereum"]),
        Target::holding_watch("w1", WALLET, ["ethereum", "solana"]),
    ]);
    h.source.holdings("w1", "ethereum", &["1"]);

    let report = h.holding_cycle().await;

    assert_eq!(report.skipped, 2);
    assert_eq!(report.processed, 1);
}

#[tokio::test]
async fn test_overlapping_ticks_skip_in_flight_pairs() {
    let h = Harness::with_source(
        vec![Target::holding_watch("w1", WALLET, ["ethereum"])],
        FakeSource::slow(Duration::from_millis(100)),
    );
    h.source.holdings("w1", "ethereum", &["1"]);

    let (first, second) = tokio::join!(h.holding_cycle(), h.holding_cycle());

    assert_eq!(first.processed + second.processed, 1);
    assert_eq!(first.skipped + second.skipped, 1);
}

#[tokio::test]
async fn test_reset_all_latches_counts_cleared() {
    let h = Harness::new(vec![
        Target {
            latched: true,
            ..Target::supply_watch("c1", "a", "ethereum", 1)
        },
        Target {
            latched: true,
            ..Target::supply_watch("c2", "b", "ethereum", 1)
        },
        Target::supply_watch("c3", "c", "ethereum", 1),
    ]);

    assert_eq!(h.poller.reset_all_latches().await.unwrap(), 2);
    assert!(h
        .store
        .list_targets()
        .await
        .unwrap()
        .iter()
        .all(|t| !t.latched));
}

#[tokio::test]
async fn test_address_case_does_not_split_baselines() {
    let mut h = Harness::new(vec![Target::holding_watch(
        "w1",
        WALLET.to_uppercase().replacen("0X", "0x", 1),
        ["Ethereum"],
    )]);
    h.source.holdings("w1", "ethereum", &["1"]);
    h.holding_cycle().await;
    h.source.holdings("w1", "ethereum", &["1", "2"]);
    h.holding_cycle().await;

    assert_eq!(h.drain().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let mut h = Harness::new(vec![Target::holding_watch("w1", WALLET, ["ethereum"])]);
    h.source.holdings("w1", "ethereum", &["1"]);
    let poller = h.poller.clone().with_intervals(
        Duration::from_secs(30),
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { poller.run(shutdown).await }
    });

    // first tick primes
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.source.holdings("w1", "ethereum", &["1", "2"]);
    tokio::time::sleep(Duration::from_secs(60)).await;

    shutdown.cancel();
    running.await.unwrap();

    let alerts = h.drain();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::NewHolding { item: item("2") });
}

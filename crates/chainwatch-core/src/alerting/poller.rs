//! Interval-driven snapshot polling
//!
//! Each tick lists the targets of one kind, fetches every (target, chain)
//! pair through the request governor in its own task, diffs the result
//! against the stored baseline or latch and hands new alerts to the sink.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::dedup::AlertDeduplicator;
use super::diff::{diff_holdings, evaluate_supply};
use super::notifier::AlertSink;
use crate::config::{Config, DedupConfig, PollingConfig};
use crate::error::{Error, Result};
use crate::governor::RequestGovernor;
use crate::models::{
    supply_dedup_prefix, AlertEvent, HoldingSnapshot, ItemId, Snapshot, SupplySnapshot, Target,
    TargetKind,
};
use crate::provider::SnapshotSource;
use crate::store::TargetStore;

type PairKey = (String, String);

/// Poller-side view of a supply watch's threshold latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Latch {
    /// Claimed by a firing pair; the store write has not finished
    Firing,
    /// Known to be set in the store as of this instant
    Persisted(Instant),
}

/// Tallies for one polling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Pairs fetched and diffed
    pub processed: usize,
    /// Pairs not attempted: invalid target, unsupported chain, or still in flight
    pub skipped: usize,
    /// Pairs whose fetch failed
    pub failed: usize,
    /// Alerts accepted by the sink
    pub delivered: usize,
    /// Alerts dropped as duplicates
    pub suppressed: usize,
    /// Alerts the sink rejected
    pub delivery_failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: PairOutcome) {
        match outcome {
            PairOutcome::Failed => self.failed += 1,
            PairOutcome::Processed(emissions) => {
                self.processed += 1;
                self.delivered += emissions.delivered;
                self.suppressed += emissions.suppressed;
                self.delivery_failed += emissions.delivery_failed;
            }
        }
    }
}

enum PairOutcome {
    Failed,
    Processed(Emissions),
}

#[derive(Default)]
struct Emissions {
    delivered: usize,
    suppressed: usize,
    delivery_failed: usize,
}

impl Emissions {
    fn record(&mut self, emission: Emission) {
        match emission {
            Emission::Delivered => self.delivered += 1,
            Emission::Suppressed => self.suppressed += 1,
            Emission::DeliveryFailed => self.delivery_failed += 1,
        }
    }
}

enum Emission {
    Delivered,
    Suppressed,
    DeliveryFailed,
}

/// Claim on a (target, chain) pair, released on drop
struct InFlight {
    pairs: Arc<DashSet<PairKey>>,
    key: PairKey,
}

impl InFlight {
    fn claim(pairs: &Arc<DashSet<PairKey>>, key: PairKey) -> Option<Self> {
        pairs.insert(key.clone()).then(|| Self {
            pairs: Arc::clone(pairs),
            key,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pairs.remove(&self.key);
    }
}

fn fetch_span(target_id: &str, chain: &str) -> Span {
    info_span!("fetch", target_id, chain)
}

fn ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = interval_at(start, period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Periodic state-diff engine over supply and holding watches.
///
/// Baselines live in memory only; a restart re-primes every holding watch.
/// Supply latches are claimed in memory before an alert goes out, so two
/// chains of one target never both fire, even across overlapping cycles.
/// A latch cleared in the store by another process is picked up on the next
/// cycle. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct StateDiffPoller {
    store: Arc<dyn TargetStore>,
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn AlertSink>,
    governor: Arc<RequestGovernor>,
    dedup: Arc<AlertDeduplicator>,
    baselines: Arc<DashMap<PairKey, BTreeSet<ItemId>>>,
    in_flight: Arc<DashSet<PairKey>>,
    latches: Arc<DashMap<String, Latch>>,
    supply_interval: Duration,
    holding_interval: Duration,
    sweep_interval: Duration,
}

impl StateDiffPoller {
    /// Create a poller with default intervals
    pub fn new(
        store: Arc<dyn TargetStore>,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn AlertSink>,
        governor: Arc<RequestGovernor>,
        dedup: Arc<AlertDeduplicator>,
    ) -> Self {
        let polling = PollingConfig::default();
        Self {
            store,
            source,
            sink,
            governor,
            dedup,
            baselines: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashSet::new()),
            latches: Arc::new(DashMap::new()),
            supply_interval: polling.supply_interval(),
            holding_interval: polling.holding_interval(),
            sweep_interval: DedupConfig::default().sweep_interval(),
        }
    }

    /// Create a poller with intervals and dedup settings from `config`
    pub fn from_config(
        config: &Config,
        store: Arc<dyn TargetStore>,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn AlertSink>,
        governor: Arc<RequestGovernor>,
    ) -> Self {
        let dedup = Arc::new(AlertDeduplicator::from_config(&config.dedup));
        Self::new(store, source, sink, governor, dedup).with_intervals(
            config.polling.supply_interval(),
            config.polling.holding_interval(),
            config.dedup.sweep_interval(),
        )
    }

    /// Override the tick intervals
    #[must_use]
    pub fn with_intervals(mut self, supply: Duration, holding: Duration, sweep: Duration) -> Self {
        self.supply_interval = supply;
        self.holding_interval = holding;
        self.sweep_interval = sweep;
        self
    }

    /// The alert deduplicator
    pub fn dedup(&self) -> &AlertDeduplicator {
        &self.dedup
    }

    /// Current baseline of a holding watch on `chain`, if primed
    pub fn baseline(&self, target_id: &str, chain: &str) -> Option<BTreeSet<ItemId>> {
        self.baselines
            .get(&(target_id.to_string(), chain.to_string()))
            .map(|b| b.value().clone())
    }

    /// Drive both watch kinds and the dedup sweep until `shutdown` fires.
    ///
    /// Cycles run as their own tasks, so a slow supply cycle never delays a
    /// holding tick. Pairs still in flight from an earlier cycle are skipped.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            supply_interval_ms = self.supply_interval.as_millis() as u64,
            holding_interval_ms = self.holding_interval.as_millis() as u64,
            "Starting state-diff poller"
        );

        let start = Instant::now();
        let mut supply = ticker(start, self.supply_interval);
        let mut holding = ticker(start, self.holding_interval);
        let mut sweep = ticker(start + self.sweep_interval, self.sweep_interval);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = supply.tick() => self.spawn_cycle(&mut cycles, TargetKind::SupplyWatch),
                _ = holding.tick() => self.spawn_cycle(&mut cycles, TargetKind::HoldingWatch),
                _ = sweep.tick() => {
                    self.dedup.sweep();
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Polling cycle task failed");
                    }
                }
            }
        }

        info!(pending = cycles.len(), "Stopping state-diff poller");
        while cycles.join_next().await.is_some() {}
    }

    fn spawn_cycle(&self, cycles: &mut JoinSet<()>, kind: TargetKind) {
        let this = self.clone();
        cycles.spawn(async move {
            match this.run_cycle(kind).await {
                Ok(report) => info!(
                    kind = %kind,
                    processed = report.processed,
                    skipped = report.skipped,
                    failed = report.failed,
                    delivered = report.delivered,
                    suppressed = report.suppressed,
                    delivery_failed = report.delivery_failed,
                    "Polling cycle finished"
                ),
                Err(e) => error!(kind = %kind, error = %e, "Polling cycle failed"),
            }
        });
    }

    /// Run one tick over every target of `kind` and wait for all pairs
    pub async fn run_cycle(&self, kind: TargetKind) -> Result<CycleReport> {
        let listed_at = Instant::now();
        let targets = self.store.list_targets().await?;
        if kind == TargetKind::SupplyWatch {
            self.sync_latches(&targets, listed_at);
        }

        let mut report = CycleReport::default();
        let mut listed = HashSet::new();
        let mut tasks = JoinSet::new();

        for target in targets.into_iter().filter(|t| t.kind == kind) {
            let target = match target.normalized() {
                Ok(normalized) => Arc::new(normalized),
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "Skipping invalid target");
                    report.skipped += 1;
                    continue;
                }
            };

            for chain in &target.chains {
                listed.insert((target.id.clone(), chain.clone()));

                if !self.source.supports_chain(chain) {
                    warn!(target_id = %target.id, chain = %chain, "Skipping unsupported chain");
                    report.skipped += 1;
                    continue;
                }

                let Some(claim) =
                    InFlight::claim(&self.in_flight, (target.id.clone(), chain.clone()))
                else {
                    debug!(target_id = %target.id, chain = %chain, "Previous tick still in flight");
                    report.skipped += 1;
                    continue;
                };

                let this = self.clone();
                let span = fetch_span(&target.id, chain);
                let target = Arc::clone(&target);
                let chain = chain.clone();
                tasks.spawn(
                    async move {
                        let _claim = claim;
                        this.process_pair(&target, &chain).await
                    }
                    .instrument(span),
                );
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(kind = %kind, error = %e, "Polling task failed");
                    report.failed += 1;
                }
            }
        }

        self.prune(kind, &listed);

        debug!(kind = %kind, ?report, "Cycle complete");
        Ok(report)
    }

    /// Forget latches the store no longer holds.
    ///
    /// Only latches persisted before `listed_at` are compared, since a
    /// listing that started earlier may predate the write.
    fn sync_latches(&self, targets: &[Target], listed_at: Instant) {
        for target in targets.iter().filter(|t| t.kind == TargetKind::SupplyWatch) {
            if target.latched {
                self.latches
                    .entry(target.id.clone())
                    .or_insert(Latch::Persisted(listed_at));
                continue;
            }

            let cleared = self
                .latches
                .remove_if(&target.id, |_, latch| {
                    matches!(latch, Latch::Persisted(at) if *at < listed_at)
                })
                .is_some();
            if cleared {
                self.dedup.forget_prefix(&supply_dedup_prefix(&target.id));
                info!(target_id = %target.id, "Threshold latch cleared in store");
            }
        }
    }

    /// Drop per-target state for pairs the store no longer lists
    fn prune(&self, kind: TargetKind, listed: &HashSet<PairKey>) {
        match kind {
            TargetKind::HoldingWatch => {
                let before = self.baselines.len();
                self.baselines.retain(|key, _| listed.contains(key));
                let pruned = before.saturating_sub(self.baselines.len());
                if pruned > 0 {
                    debug!(pruned, "Pruned holding baselines");
                }
            }
            TargetKind::SupplyWatch => {
                let ids: HashSet<&str> = listed.iter().map(|(id, _)| id.as_str()).collect();
                self.latches.retain(|id, _| ids.contains(id.as_str()));
            }
        }
    }

    async fn process_pair(&self, target: &Target, chain: &str) -> PairOutcome {
        let fetched = self
            .governor
            .execute(|| self.source.fetch_snapshot(target, chain))
            .await;

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(Error::Cancelled) => {
                debug!(target_id = %target.id, chain, "Fetch cancelled");
                return PairOutcome::Failed;
            }
            Err(e) => {
                counter!("chainwatch_fetch_failures_total", "kind" => target.kind.to_string())
                    .increment(1);
                warn!(
                    target_id = %target.id,
                    chain,
                    max_retries = self.governor.retrier().max_retries(),
                    error = %e,
                    "Failed to fetch snapshot, skipping tick"
                );
                return PairOutcome::Failed;
            }
        };

        let now = Utc::now();
        match (target.kind, snapshot) {
            (TargetKind::HoldingWatch, Snapshot::Holding(holdings)) => {
                PairOutcome::Processed(self.apply_holdings(target, chain, &holdings, now).await)
            }
            (TargetKind::SupplyWatch, Snapshot::Supply(supply)) => {
                PairOutcome::Processed(self.apply_supply(target, chain, &supply, now).await)
            }
            (kind, _) => {
                warn!(target_id = %target.id, chain, kind = %kind, "Snapshot does not match target kind");
                PairOutcome::Failed
            }
        }
    }

    async fn apply_holdings(
        &self,
        target: &Target,
        chain: &str,
        holdings: &HoldingSnapshot,
        now: DateTime<Utc>,
    ) -> Emissions {
        let key = (target.id.clone(), chain.to_string());
        let baseline = self.baselines.get(&key).map(|b| b.value().clone());

        let diff = diff_holdings(target, chain, baseline.as_ref(), holdings, now);
        if diff.primed {
            info!(target_id = %target.id, chain, items = diff.baseline.len(), "Primed holdings baseline");
        } else if !diff.events.is_empty() {
            info!(target_id = %target.id, chain, added = diff.events.len(), "New holdings detected");
        }

        let mut emissions = Emissions::default();
        for event in &diff.events {
            emissions.record(self.emit(event).await);
        }

        self.baselines.insert(key, diff.baseline);
        emissions
    }

    async fn apply_supply(
        &self,
        target: &Target,
        chain: &str,
        supply: &SupplySnapshot,
        now: DateTime<Utc>,
    ) -> Emissions {
        let latched = target.latched || self.latches.contains_key(&target.id);
        let evaluation = evaluate_supply(target, chain, latched, supply, now);

        debug!(
            target_id = %target.id,
            chain,
            count = supply.count,
            threshold = ?target.threshold,
            latched,
            "Evaluated supply"
        );

        let mut emissions = Emissions::default();
        let Some(event) = evaluation.event else {
            return emissions;
        };

        // another chain, possibly from an earlier cycle, may have crossed first
        if !self.claim_latch(&target.id) {
            return emissions;
        }

        info!(target_id = %target.id, chain, count = supply.count, "Supply threshold reached");
        emissions.record(self.emit(&event).await);

        match self.store.set_latch(&target.id, true).await {
            Ok(()) => {
                if let Some(mut latch) = self.latches.get_mut(&target.id) {
                    *latch = Latch::Persisted(Instant::now());
                }
            }
            // the in-memory claim still holds until reset
            Err(e) => error!(target_id = %target.id, error = %e, "Failed to persist threshold latch"),
        }
        emissions
    }

    fn claim_latch(&self, target_id: &str) -> bool {
        match self.latches.entry(target_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Latch::Firing);
                true
            }
        }
    }

    async fn emit(&self, event: &AlertEvent) -> Emission {
        if !self.dedup.should_emit(&event.dedup_key) {
            counter!("chainwatch_alerts_suppressed_total").increment(1);
            debug!(dedup_key = %event.dedup_key, "Suppressed duplicate alert");
            return Emission::Suppressed;
        }

        match self.sink.deliver(event).await {
            Ok(()) => {
                counter!("chainwatch_alerts_emitted_total").increment(1);
                Emission::Delivered
            }
            Err(e) => {
                counter!("chainwatch_deliveries_failed_total").increment(1);
                error!(
                    target_id = %event.target_id,
                    chain = %event.chain,
                    dedup_key = %event.dedup_key,
                    error = %e,
                    "Failed to deliver alert"
                );
                Emission::DeliveryFailed
            }
        }
    }

    /// Fetch one target's current snapshot on each of its chains.
    ///
    /// Read-only: baselines, latches and dedup state are left alone. A
    /// failure on one chain is reported in its slot rather than failing the
    /// whole check.
    pub async fn check_target(&self, target_id: &str) -> Result<Vec<(String, Result<Snapshot>)>> {
        let target = self
            .store
            .list_targets()
            .await?
            .into_iter()
            .find(|t| t.id == target_id)
            .ok_or_else(|| Error::not_found("target", target_id))?
            .normalized()?;

        let mut results = Vec::with_capacity(target.chains.len());
        for chain in &target.chains {
            let outcome = if self.source.supports_chain(chain) {
                self.governor
                    .execute(|| self.source.fetch_snapshot(&target, chain))
                    .instrument(fetch_span(&target.id, chain))
                    .await
            } else {
                Err(Error::validation(format!("unsupported chain: {chain}")))
            };
            results.push((chain.clone(), outcome));
        }
        Ok(results)
    }

    /// Clear the threshold latch of one target so it can fire again
    pub async fn reset_latch(&self, target_id: &str) -> Result<()> {
        self.store.set_latch(target_id, false).await?;
        self.latches.remove(target_id);
        self.dedup.forget_prefix(&supply_dedup_prefix(target_id));
        info!(target_id, "Reset threshold latch");
        Ok(())
    }

    /// Clear every set latch; returns how many were cleared
    pub async fn reset_all_latches(&self) -> Result<usize> {
        let targets = self.store.list_targets().await?;
        let mut reset = 0;
        for target in targets
            .iter()
            .filter(|t| t.kind == TargetKind::SupplyWatch && t.latched)
        {
            self.reset_latch(&target.id).await?;
            reset += 1;
        }
        Ok(reset)
    }
}

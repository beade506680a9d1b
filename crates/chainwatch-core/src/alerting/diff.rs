//! Snapshot comparison
//!
//! Pure functions from `(target, chain, previous state, snapshot, now)` to the
//! next state and the alerts it produces. Nothing here performs I/O; the
//! poller owns scheduling, dedup and delivery.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::models::{AlertEvent, HoldingSnapshot, ItemId, SupplySnapshot, Target};

/// Result of comparing a holding snapshot against its baseline
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingDiff {
    /// Replacement baseline
    pub baseline: BTreeSet<ItemId>,
    /// One alert per added item, in item order
    pub events: Vec<AlertEvent>,
    /// Whether this comparison primed a missing baseline
    pub primed: bool,
}

/// Compare a wallet's current holdings with its baseline.
///
/// Without a baseline the snapshot only primes one. Removed items never
/// alert.
pub fn diff_holdings(
    target: &Target,
    chain: &str,
    baseline: Option<&BTreeSet<ItemId>>,
    current: &HoldingSnapshot,
    now: DateTime<Utc>,
) -> HoldingDiff {
    let Some(baseline) = baseline else {
        return HoldingDiff {
            baseline: current.ids(),
            events: Vec::new(),
            primed: true,
        };
    };

    let events = current
        .items
        .iter()
        .filter(|(id, _)| !baseline.contains(*id))
        .map(|(id, details)| AlertEvent::new_holding(target, chain, id, Some(details), now))
        .collect();

    HoldingDiff {
        baseline: current.ids(),
        events,
        primed: false,
    }
}

/// Result of checking a supply snapshot against a threshold
#[derive(Debug, Clone, PartialEq)]
pub struct SupplyEvaluation {
    /// Latch state after this observation
    pub latched: bool,
    /// Threshold alert, when one fires
    pub event: Option<AlertEvent>,
}

/// Check a collection count against the target's threshold.
///
/// Fires once when `count >= threshold` and the latch is clear; the latch
/// then stays set regardless of later counts.
pub fn evaluate_supply(
    target: &Target,
    chain: &str,
    latched: bool,
    snapshot: &SupplySnapshot,
    now: DateTime<Utc>,
) -> SupplyEvaluation {
    let event = match target.threshold {
        Some(threshold) if !latched && snapshot.count >= threshold => Some(
            AlertEvent::supply_threshold(target, chain, threshold, snapshot, now),
        ),
        _ => None,
    };

    SupplyEvaluation {
        latched: latched || event.is_some(),
        event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertKind, ItemDetails};
    use pretty_assertions::assert_eq;

    const WALLET: &str = "0xabcdef0123456789abcdef0123456789abcdef01";

    fn item(token: &str) -> ItemId {
        ItemId::new("0xaaa", token)
    }

    fn holdings(tokens: &[&str]) -> HoldingSnapshot {
        HoldingSnapshot::from_ids(tokens.iter().map(|t| item(t)))
    }

    #[test]
    fn test_first_snapshot_primes_without_alerts() {
        let target = Target::holding_watch("w1", WALLET, ["ethereum"]);
        let diff = diff_holdings(&target, "ethereum", None, &holdings(&["1", "2", "3"]), Utc::now());

        assert!(diff.primed);
        assert!(diff.events.is_empty());
        assert_eq!(diff.baseline.len(), 3);
    }

    #[test]
    fn test_added_item_alerts_and_replaces_baseline() {
        let target = Target::holding_watch("w1", WALLET, ["ethereum"]);
        let baseline: BTreeSet<_> = [item("A"), item("B")].into();

        let diff = diff_holdings(
            &target,
            "ethereum",
            Some(&baseline),
            &holdings(&["A", "B", "C"]),
            Utc::now(),
        );

        assert!(!diff.primed);
        assert_eq!(diff.events.len(), 1);
        assert_eq!(diff.events[0].kind, AlertKind::NewHolding { item: item("C") });
        assert_eq!(diff.events[0].dedup_key, "holding:w1:ethereum:0xaaa:C");
        assert_eq!(diff.baseline, [item("A"), item("B"), item("C")].into());
    }

    #[test]
    fn test_removed_items_are_dropped_silently() {
        let target = Target::holding_watch("w1", WALLET, ["ethereum"]);
        let baseline: BTreeSet<_> = [item("A"), item("B")].into();

        let diff = diff_holdings(&target, "ethereum", Some(&baseline), &holdings(&["B"]), Utc::now());

        assert!(diff.events.is_empty());
        assert_eq!(diff.baseline, [item("B")].into());
    }

    #[test]
    fn test_new_item_alert_carries_details() {
        let target = Target::holding_watch("w1", WALLET, ["polygon"]);
        let mut current = HoldingSnapshot::default();
        current.insert(
            item("9"),
            ItemDetails {
                name: Some("Thing #9".to_string()),
                image_url: Some("https://img/9.png".to_string()),
            },
        );

        let diff = diff_holdings(&target, "polygon", Some(&BTreeSet::new()), &current, Utc::now());

        let payload = &diff.events[0].payload;
        assert_eq!(payload.image_url.as_deref(), Some("https://img/9.png"));
        assert!(payload.fields.iter().any(|f| f.value == "Thing #9"));
    }

    #[test]
    fn test_supply_latch_sequence() {
        let target = Target::supply_watch("c1", "slug", "ethereum", 100);
        let now = Utc::now();

        let below = evaluate_supply(&target, "ethereum", false, &SupplySnapshot::with_count(99), now);
        assert_eq!(below, SupplyEvaluation { latched: false, event: None });

        let crossed = evaluate_supply(&target, "ethereum", false, &SupplySnapshot::with_count(120), now);
        assert!(crossed.latched);
        assert_eq!(
            crossed.event.map(|e| e.kind),
            Some(AlertKind::SupplyThreshold { count: 120, threshold: 100 })
        );

        let held = evaluate_supply(&target, "ethereum", true, &SupplySnapshot::with_count(130), now);
        assert_eq!(held, SupplyEvaluation { latched: true, event: None });

        let after_reset = evaluate_supply(&target, "ethereum", false, &SupplySnapshot::with_count(131), now);
        assert!(after_reset.event.is_some());
    }

    #[test]
    fn test_supply_fires_at_exact_threshold() {
        let target = Target::supply_watch("c1", "slug", "ethereum", 50);
        let evaluation = evaluate_supply(&target, "ethereum", false, &SupplySnapshot::with_count(50), Utc::now());
        let event = evaluation.event.unwrap();
        assert!(event.payload.message.contains("50"));
        assert_eq!(event.dedup_key, "supply:c1:50:50");
    }

    #[test]
    fn test_supply_below_threshold_keeps_latch() {
        let target = Target::supply_watch("c1", "slug", "ethereum", 50);
        let evaluation = evaluate_supply(&target, "ethereum", true, &SupplySnapshot::with_count(10), Utc::now());
        assert!(evaluation.latched);
    }
}

//! State-diff alerting
//!
//! Snapshot comparison, threshold latching, dedup and delivery.

mod dedup;
mod diff;
mod notifier;
mod poller;

pub use dedup::AlertDeduplicator;
pub use diff::{diff_holdings, evaluate_supply, HoldingDiff, SupplyEvaluation};
pub use notifier::{sink_from_config, AlertSink, ChannelSink, LogSink, WebhookSink};
pub use poller::{CycleReport, StateDiffPoller};

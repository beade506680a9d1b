//! Alert data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::snapshot::{ItemDetails, ItemId, SupplySnapshot};
use super::target::Target;

/// What condition raised the alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// Supply count reached the target's threshold
    SupplyThreshold {
        /// Observed count
        count: u64,
        /// Configured threshold
        threshold: u64,
    },
    /// A wallet holds an item it did not hold on the previous tick
    NewHolding {
        /// The newly held item
        item: ItemId,
    },
}

/// A single labelled value in a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadField {
    /// Label
    pub name: String,
    /// Value
    pub value: String,
    /// Whether the field can share a row with others
    pub inline: bool,
}

impl PayloadField {
    fn new(name: &str, value: impl Into<String>, inline: bool) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline,
        }
    }
}

/// Human-displayable content of an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Headline
    pub title: String,
    /// Body text
    pub message: String,
    /// Labelled values
    pub fields: Vec<PayloadField>,
    /// Thumbnail image
    pub image_url: Option<String>,
    /// Link for the headline
    pub url: Option<String>,
}

/// An emitted notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Unique identifier
    pub id: Uuid,

    /// Condition that fired
    pub kind: AlertKind,

    /// Target that fired
    pub target_id: String,

    /// Chain the condition was observed on
    pub chain: String,

    /// Deterministic key for suppressing repeats
    pub dedup_key: String,

    /// Display content
    pub payload: AlertPayload,

    /// When the alert was generated
    pub created_at: DateTime<Utc>,
}

/// Common prefix of every supply dedup key of a target
pub fn supply_dedup_prefix(target_id: &str) -> String {
    format!("supply:{target_id}:")
}

/// Dedup key for a supply threshold crossing observed at `count`
pub fn supply_dedup_key(target_id: &str, threshold: u64, count: u64) -> String {
    format!("{}{threshold}:{count}", supply_dedup_prefix(target_id))
}

/// Dedup key for a newly held item
pub fn holding_dedup_key(target_id: &str, chain: &str, item: &ItemId) -> String {
    format!("holding:{target_id}:{chain}:{item}")
}

impl AlertEvent {
    /// Build the threshold alert for a supply watch
    pub fn supply_threshold(
        target: &Target,
        chain: &str,
        threshold: u64,
        snapshot: &SupplySnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        let floor = snapshot
            .floor_price
            .map_or_else(|| "Unknown".to_string(), |p| format!("{p} ETH"));

        let payload = AlertPayload {
            title: format!("{}: Supply Threshold Reached", target.display_name()),
            message: format!(
                "Supply count {} reached threshold {} on {}",
                snapshot.count, threshold, chain
            ),
            fields: vec![
                PayloadField::new("Contract", format!("`{}`", target.locator), false),
                PayloadField::new("Count", snapshot.count.to_string(), true),
                PayloadField::new("Threshold", threshold.to_string(), true),
                PayloadField::new("Floor Price", floor, true),
            ],
            image_url: snapshot.image_url.clone(),
            url: snapshot.marketplace_url.clone(),
        };

        Self {
            id: Uuid::new_v4(),
            kind: AlertKind::SupplyThreshold {
                count: snapshot.count,
                threshold,
            },
            target_id: target.id.clone(),
            chain: chain.to_string(),
            dedup_key: supply_dedup_key(&target.id, threshold, snapshot.count),
            payload,
            created_at: now,
        }
    }

    /// Build the alert for an item newly held by a wallet
    pub fn new_holding(
        target: &Target,
        chain: &str,
        item: &ItemId,
        details: Option<&ItemDetails>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut fields = vec![
            PayloadField::new("Contract", format!("`{}`", item.contract), true),
            PayloadField::new("Token ID", item.token_id.clone(), true),
        ];
        if let Some(name) = details.and_then(|d| d.name.as_deref()) {
            fields.push(PayloadField::new("Name", name, false));
        }

        let payload = AlertPayload {
            title: "New NFT Detected".to_string(),
            message: format!(
                "Wallet **{}** now holds a new NFT on **{}**",
                target.locator, chain
            ),
            fields,
            image_url: details.and_then(|d| d.image_url.clone()),
            url: None,
        };

        Self {
            id: Uuid::new_v4(),
            kind: AlertKind::NewHolding { item: item.clone() },
            target_id: target.id.clone(),
            chain: chain.to_string(),
            dedup_key: holding_dedup_key(&target.id, chain, item),
            payload,
            created_at: now,
        }
    }
}

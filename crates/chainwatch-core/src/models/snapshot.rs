//! Snapshot models: one observation of a target's remote state

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a held item: contract plus token id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId {
    /// Contract address (lower-cased)
    pub contract: String,
    /// Token id as reported by the provider
    pub token_id: String,
}

impl ItemId {
    /// Create an item id, lower-casing the contract
    pub fn new(contract: impl AsRef<str>, token_id: impl Into<String>) -> Self {
        Self {
            contract: contract.as_ref().trim().to_lowercase(),
            token_id: token_id.into(),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.contract, self.token_id)
    }
}

/// Display metadata for a held item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDetails {
    /// Item title
    pub name: Option<String>,
    /// Image URL
    pub image_url: Option<String>,
}

/// Supply observation for a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplySnapshot {
    /// Observed count compared against the threshold
    pub count: u64,
    /// Floor price in the chain's native unit
    pub floor_price: Option<f64>,
    /// Collection image
    pub image_url: Option<String>,
    /// Marketplace page
    pub marketplace_url: Option<String>,
}

impl SupplySnapshot {
    /// Snapshot with only a count
    pub fn with_count(count: u64) -> Self {
        Self {
            count,
            floor_price: None,
            image_url: None,
            marketplace_url: None,
        }
    }
}

/// Holdings observation for a wallet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    /// Held items keyed by id; keys are unique by construction
    pub items: BTreeMap<ItemId, ItemDetails>,
}

impl HoldingSnapshot {
    /// Snapshot from bare ids
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = ItemId>,
    {
        Self {
            items: ids.into_iter().map(|id| (id, ItemDetails::default())).collect(),
        }
    }

    /// Add an item; a repeated id keeps the first details seen
    pub fn insert(&mut self, id: ItemId, details: ItemDetails) {
        self.items.entry(id).or_insert(details);
    }

    /// Ids in this snapshot
    pub fn ids(&self) -> BTreeSet<ItemId> {
        self.items.keys().cloned().collect()
    }

    /// Number of held items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items are held
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Remote state of a target at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    /// Collection supply
    Supply(SupplySnapshot),
    /// Wallet holdings
    Holding(HoldingSnapshot),
}

/// Parse a remote count field into a non-negative integer.
///
/// Accepts JSON numbers and numeric strings. Anything else is a
/// [`Error::ProviderData`], never zero.
pub fn parse_count(value: &serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
                _ => Err(Error::provider_data(format!("count {n} is not a non-negative integer"))),
            }
        }
        serde_json::Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::provider_data(format!("count '{s}' is not a non-negative integer"))),
        serde_json::Value::Null => Err(Error::provider_data("count is missing")),
        other => Err(Error::provider_data(format!("count has unexpected type: {other}"))),
    }
}

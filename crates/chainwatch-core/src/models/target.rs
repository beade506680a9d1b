//! Tracked target model

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Chain used when a target declares none
pub const DEFAULT_CHAIN: &str = "ethereum";

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[a-fA-F0-9]{40}$").expect("address pattern is valid"));

/// Whether `s` looks like an EVM address
pub fn is_address(s: &str) -> bool {
    ADDRESS_RE.is_match(s)
}

/// Kind of watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Alert once when a collection's count reaches a threshold
    SupplyWatch,
    /// Alert on every item newly held by a wallet
    HoldingWatch,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SupplyWatch => f.write_str("supply-watch"),
            Self::HoldingWatch => f.write_str("holding-watch"),
        }
    }
}

/// A tracked entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Kind of watch
    pub kind: TargetKind,

    /// Chain/network labels
    #[serde(default)]
    pub chains: Vec<String>,

    /// Contract address, collection slug, or wallet address
    pub locator: String,

    /// Count at or above which a supply watch fires
    #[serde(default)]
    pub threshold: Option<u64>,

    /// Whether the threshold alert already fired
    #[serde(default)]
    pub latched: bool,
}

impl Target {
    /// Create a supply watch
    pub fn supply_watch(
        id: impl Into<String>,
        locator: impl Into<String>,
        chain: impl Into<String>,
        threshold: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: TargetKind::SupplyWatch,
            chains: vec![chain.into()],
            locator: locator.into(),
            threshold: Some(threshold),
            latched: false,
        }
    }

    /// Create a holding watch
    pub fn holding_watch<I, S>(id: impl Into<String>, address: impl Into<String>, chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: None,
            kind: TargetKind::HoldingWatch,
            chains: chains.into_iter().map(Into::into).collect(),
            locator: address.into(),
            threshold: None,
            latched: false,
        }
    }

    /// Name for display, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Declared chains, or the default chain when none are declared
    pub fn effective_chains(&self) -> Vec<String> {
        if self.chains.is_empty() {
            return vec![DEFAULT_CHAIN.to_string()];
        }
        let mut chains: Vec<String> = self.chains.iter().map(|c| c.trim().to_lowercase()).collect();
        chains.sort();
        chains.dedup();
        chains
    }

    /// Normalize and validate the target for polling
    pub fn normalized(&self) -> Result<Self> {
        let mut target = self.clone();
        target.locator = target.locator.trim().to_string();
        target.chains = self.effective_chains();

        if target.id.trim().is_empty() {
            return Err(Error::validation("target id is empty"));
        }

        match target.kind {
            TargetKind::HoldingWatch => {
                target.locator = target.locator.to_lowercase();
                if !is_address(&target.locator) {
                    return Err(Error::validation(format!(
                        "target {} has invalid wallet address '{}'",
                        target.id, self.locator
                    )));
                }
            }
            TargetKind::SupplyWatch => {
                if target.locator.is_empty() {
                    return Err(Error::validation(format!(
                        "target {} has no contract or slug",
                        target.id
                    )));
                }
                if target.threshold.is_none() {
                    return Err(Error::validation(format!(
                        "supply watch {} has no threshold",
                        target.id
                    )));
                }
            }
        }

        Ok(target)
    }
}

//! HTTP snapshot source backed by Alchemy- and OpenSea-style APIs
//!
//! Wallet holdings come from the NFT API `getNFTs` endpoint. Collection supply
//! comes from collection stats when a slug is known, otherwise from contract
//! metadata.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::SnapshotSource;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{
    is_address, parse_count, HoldingSnapshot, ItemDetails, ItemId, Snapshot, SupplySnapshot,
    Target, TargetKind,
};

/// Upper bound on followed `pageKey`s for one wallet
const MAX_HOLDING_PAGES: usize = 20;

/// Longest upstream error body kept in error messages
const MAX_ERROR_BODY: usize = 200;

fn alchemy_network(chain: &str) -> Option<&'static str> {
    match chain {
        "ethereum" => Some("eth-mainnet"),
        "polygon" => Some("polygon-mainnet"),
        "arbitrum" => Some("arb-mainnet"),
        "optimism" => Some("opt-mainnet"),
        "base" => Some("base-mainnet"),
        _ => None,
    }
}

/// Map a non-success status to the error taxonomy
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        Error::RateLimited(format!("{status}: {message}"))
    } else if status.is_server_error() {
        Error::network(format!("{status}: {message}"))
    } else {
        Error::Upstream {
            status: status.as_u16(),
            message,
        }
    }
}

/// Host and last path segment; keeps API keys embedded in paths out of logs
fn redacted(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or_default();
    format!("{}/…/{}", url.host_str().unwrap_or_default(), last)
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract id and display metadata from one `ownedNfts` entry
fn parse_owned_nft(nft: &Value) -> Option<(ItemId, ItemDetails)> {
    let contract = str_field(nft, "/contract/address").or_else(|| str_field(nft, "/contractAddress"))?;
    let token_id = nft
        .get("tokenId")
        .and_then(as_string)
        .or_else(|| nft.pointer("/id/tokenId").and_then(as_string))
        .or_else(|| nft.get("token_id").and_then(as_string))?;

    let details = ItemDetails {
        name: str_field(nft, "/title").or_else(|| str_field(nft, "/metadata/name")),
        image_url: str_field(nft, "/media/0/gateway")
            .or_else(|| str_field(nft, "/metadata/image"))
            .or_else(|| str_field(nft, "/image_url")),
    };

    Some((ItemId::new(contract, token_id), details))
}

/// Snapshot source talking to Alchemy and OpenSea over HTTP
pub struct HttpSnapshotSource {
    client: Client,
    config: ProviderConfig,
}

impl HttpSnapshotSource {
    /// Create a source from provider settings
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn alchemy_url(&self, chain: &str, method: &str) -> Result<Url> {
        let network = alchemy_network(chain)
            .ok_or_else(|| Error::config(format!("no Alchemy network for chain '{chain}'")))?;
        let key = self
            .config
            .alchemy_api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("provider.alchemy_api_key is not set"))?;

        let base = self.config.alchemy_base_url.replace("{network}", network);
        let raw = format!("{}/{}/{}", base.trim_end_matches('/'), key, method);
        Url::parse(&raw).map_err(|e| Error::config(format!("invalid Alchemy URL: {e}")))
    }

    fn opensea_url(&self, path: &str) -> Result<Url> {
        let raw = format!(
            "{}/{}",
            self.config.opensea_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&raw).map_err(|e| Error::config(format!("invalid OpenSea URL: {e}")))
    }

    async fn get_json(&self, url: Url, opensea: bool) -> Result<Value> {
        let endpoint = redacted(&url);
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json");
        if opensea {
            if let Some(key) = self.config.opensea_api_key.as_deref() {
                request = request.header("x-api-key", key);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(endpoint = %endpoint, status = status.as_u16(), "Upstream returned error status");
            return Err(classify_status(status, &body));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::provider_data(format!("invalid JSON from {endpoint}: {e}")))
    }

    async fn fetch_holdings(&self, owner: &str, chain: &str) -> Result<HoldingSnapshot> {
        let mut snapshot = HoldingSnapshot::default();
        let mut page_key: Option<String> = None;

        for page in 0..MAX_HOLDING_PAGES {
            let mut url = self.alchemy_url(chain, "getNFTs/")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("owner", owner);
                if let Some(key) = &page_key {
                    query.append_pair("pageKey", key);
                }
            }

            let body = self.get_json(url, false).await?;
            let owned = body
                .get("ownedNfts")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::provider_data("response has no ownedNfts array"))?;

            for nft in owned {
                match parse_owned_nft(nft) {
                    Some((id, details)) => snapshot.insert(id, details),
                    None => debug!(owner, chain, "Skipping NFT without contract or token id"),
                }
            }

            page_key = str_field(&body, "/pageKey");
            if page_key.is_none() {
                return Ok(snapshot);
            }
            debug!(owner, chain, page = page + 1, "Following holdings page");
        }

        // a partial set would drop items from the baseline and re-alert on them later
        Err(Error::provider_data(format!(
            "holdings of {owner} on {chain} exceed {MAX_HOLDING_PAGES} pages"
        )))
    }

    async fn fetch_supply(&self, locator: &str, chain: &str) -> Result<SupplySnapshot> {
        let slug = if is_address(locator) {
            if self.config.opensea_api_key.is_some() {
                self.resolve_slug(locator, chain).await?
            } else {
                None
            }
        } else {
            Some(locator.to_string())
        };

        match slug {
            Some(slug) => self.fetch_collection_stats(&slug).await,
            None => self.fetch_contract_supply(locator, chain).await,
        }
    }

    async fn resolve_slug(&self, contract: &str, chain: &str) -> Result<Option<String>> {
        let url = self.opensea_url(&format!("chain/{chain}/contract/{contract}"))?;
        match self.get_json(url, true).await {
            Ok(body) => Ok(str_field(&body, "/collection").or_else(|| str_field(&body, "/collection/slug"))),
            Err(Error::Upstream { status: 404, .. }) => {
                debug!(contract, chain, "Contract unknown to OpenSea, using contract metadata");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_collection_stats(&self, slug: &str) -> Result<SupplySnapshot> {
        let stats = self
            .get_json(self.opensea_url(&format!("collections/{slug}/stats"))?, true)
            .await?;

        let total = stats
            .get("total")
            .ok_or_else(|| Error::provider_data(format!("stats for {slug} have no total")))?;
        let count = match total.get("supply").or_else(|| total.get("token_count")) {
            Some(value) => parse_count(value)?,
            None => return Err(Error::provider_data(format!("stats for {slug} have no supply"))),
        };
        let floor_price = total
            .get("floor_price")
            .and_then(|v| v.as_f64().or_else(|| v.get("value").and_then(Value::as_f64)));

        // auxiliary metrics only; a failure here does not void the count
        let (image_url, marketplace_url) = match self
            .get_json(self.opensea_url(&format!("collections/{slug}"))?, true)
            .await
        {
            Ok(meta) => (
                str_field(&meta, "/image_url"),
                str_field(&meta, "/opensea_url").or_else(|| str_field(&meta, "/external_url")),
            ),
            Err(e) => {
                debug!(slug, error = %e, "Collection metadata unavailable");
                (None, None)
            }
        };

        Ok(SupplySnapshot {
            count,
            floor_price,
            image_url,
            marketplace_url,
        })
    }

    async fn fetch_contract_supply(&self, contract: &str, chain: &str) -> Result<SupplySnapshot> {
        let mut url = self.alchemy_url(chain, "getContractMetadata")?;
        url.query_pairs_mut().append_pair("contractAddress", contract);

        let body = self.get_json(url, false).await?;
        let count = match body.pointer("/contractMetadata/totalSupply") {
            Some(value) => parse_count(value)?,
            None => {
                return Err(Error::provider_data(format!(
                    "contract metadata for {contract} has no totalSupply"
                )))
            }
        };

        Ok(SupplySnapshot::with_count(count))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self, target: &Target, chain: &str) -> Result<Snapshot> {
        match target.kind {
            TargetKind::HoldingWatch => self
                .fetch_holdings(&target.locator, chain)
                .await
                .map(Snapshot::Holding),
            TargetKind::SupplyWatch => self
                .fetch_supply(&target.locator, chain)
                .await
                .map(Snapshot::Supply),
        }
    }

    fn supports_chain(&self, chain: &str) -> bool {
        self.config.supported_chains.iter().any(|c| c == chain)
    }
}

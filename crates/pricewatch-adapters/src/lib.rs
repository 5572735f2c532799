//! Price source contracts + the Steam storefront and offline fixture implementations.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use pricewatch_core::{Observation, PriceState, TrackedItem};
use pricewatch_storage::{HttpError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "pricewatch-adapters";

pub const STEAM_APPDETAILS_URL: &str = "https://store.steampowered.com/api/appdetails";

/// Per-run inputs shared by every fetch of that run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub observed_at: NaiveDateTime,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding appdetails for {item_id}: {source}")]
    Decode {
        item_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no data found for app {item_id}")]
    MissingItem { item_id: String },
    #[error("store reported an unsuccessful lookup for app {item_id}")]
    Unsuccessful { item_id: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Http(err) if err.is_timeout())
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, item: &TrackedItem, ctx: &FetchContext) -> Result<Observation, FetchError>;
}

#[derive(Debug, Deserialize)]
struct AppDetailsEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct AppData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_free: bool,
    #[serde(default)]
    price_overview: Option<PriceOverview>,
}

#[derive(Debug, Deserialize)]
struct PriceOverview {
    currency: String,
    initial: i64,
    #[serde(rename = "final")]
    final_price: i64,
    #[serde(default)]
    discount_percent: u8,
}

impl From<PriceOverview> for PriceState {
    fn from(overview: PriceOverview) -> Self {
        PriceState::Priced {
            final_minor: overview.final_price,
            initial_minor: overview.initial,
            currency: overview.currency,
            discount_percent: overview.discount_percent,
        }
    }
}

/// Turn an `appdetails` response body into an observation of `item`.
///
/// The body is keyed by app id; a missing key or `success: false` is a fetch
/// failure. Without a `price_overview` the app is either free to play or has
/// no price yet.
pub fn parse_app_details(
    item: &TrackedItem,
    body: &[u8],
    observed_at: NaiveDateTime,
) -> Result<Observation, FetchError> {
    let decode = |source| FetchError::Decode {
        item_id: item.id.clone(),
        source,
    };
    let mut envelopes: HashMap<String, AppDetailsEnvelope> =
        serde_json::from_slice(body).map_err(decode)?;
    let envelope = envelopes
        .remove(&item.id)
        .ok_or_else(|| FetchError::MissingItem {
            item_id: item.id.clone(),
        })?;
    if !envelope.success {
        return Err(FetchError::Unsuccessful {
            item_id: item.id.clone(),
        });
    }
    let data: AppData = match envelope.data {
        Some(value) => serde_json::from_value(value).map_err(decode)?,
        None => {
            return Err(FetchError::Unsuccessful {
                item_id: item.id.clone(),
            })
        }
    };

    let name = data
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| item.fallback_name());
    let price_state = match data.price_overview {
        Some(overview) => overview.into(),
        None if data.is_free => PriceState::FreeToPlay,
        None => PriceState::NoPriceData,
    };

    Ok(Observation {
        item_id: item.id.clone(),
        name,
        price_state,
        observed_at,
    })
}

/// Live Steam storefront lookups, one request per item.
#[derive(Debug, Clone)]
pub struct SteamStoreSource {
    http: HttpFetcher,
    endpoint: String,
    market: String,
}

impl SteamStoreSource {
    pub fn new(http: HttpFetcher, market: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: STEAM_APPDETAILS_URL.to_string(),
            market: market.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl PriceSource for SteamStoreSource {
    fn source_id(&self) -> &'static str {
        "steam-store"
    }

    async fn fetch(&self, item: &TrackedItem, ctx: &FetchContext) -> Result<Observation, FetchError> {
        let query = [
            ("appids", item.id.as_str()),
            ("cc", self.market.as_str()),
            ("filters", "price_overview,basic"),
        ];
        let response = self.http.fetch_bytes(&self.endpoint, &query).await?;
        debug!(
            item_id = %item.id,
            status = response.status.as_u16(),
            bytes = response.body.len(),
            "appdetails fetched"
        );
        parse_app_details(item, &response.body, ctx.observed_at)
    }
}

/// Reads captured `appdetails` bodies from `<dir>/<item id>.json`.
#[derive(Debug, Clone)]
pub struct FixturePriceSource {
    dir: PathBuf,
}

impl FixturePriceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn fixture_path(&self, item: &TrackedItem) -> PathBuf {
        self.dir.join(format!("{}.json", item.id))
    }
}

#[async_trait]
impl PriceSource for FixturePriceSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, item: &TrackedItem, ctx: &FetchContext) -> Result<Observation, FetchError> {
        let path = self.fixture_path(item);
        let body = fs::read(&path)
            .await
            .map_err(|source| FetchError::Fixture { path, source })?;
        parse_app_details(item, &body, ctx.observed_at)
    }
}
